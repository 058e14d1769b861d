//! DEALER client for the iot-ubusd bus, following zguide's Lazy Pirate pattern.
//!
//! Architecture: reactor pattern to avoid lock contention
//! - Socket owned by a dedicated reactor task
//! - Requests flow through an mpsc channel
//! - Responses routed back via oneshot channels keyed by request_id
//!
//! ```ignore
//! let client = BusClient::connect(ClientConfig::new("cli", "tcp://127.0.0.1:5590")).await?;
//! let reply = client.call("lamp", "on", serde_json::json!({})).await?;
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as AnyhowContext, Result};
use bytes::Bytes;
use rzmq::Socket;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::catalog::ServiceCatalog;
use crate::envelope::{CallEnvelope, ReplyEnvelope};
use crate::frame::{BusFrame, Command};
use crate::lazy_pirate::LazyPirateConfig;
use crate::socket_config::{create_dealer_and_connect, frames_to_msgs, msgs_to_frames};

/// Command sent to the reactor task
enum ReactorCommand {
    Request {
        frames: Vec<Bytes>,
        request_id: Uuid,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<BusFrame>>,
    },
    Shutdown,
}

struct PendingRequest {
    response_tx: oneshot::Sender<Result<BusFrame>>,
    deadline: Instant,
}

/// Configuration for BusClient
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name for logging and the DEALER routing identity prefix
    pub name: String,
    /// ZMQ endpoint (e.g., "tcp://127.0.0.1:5590")
    pub endpoint: String,
    pub pirate: LazyPirateConfig,
}

impl ClientConfig {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            pirate: LazyPirateConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.pirate.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.pirate.max_retries = max_retries;
        self
    }
}

/// The reactor task - owns the socket, handles all I/O.
async fn reactor_task(socket: Socket, mut cmd_rx: mpsc::Receiver<ReactorCommand>, name: String) {
    let mut pending: HashMap<Uuid, PendingRequest> = HashMap::new();
    let mut cleanup_interval = tokio::time::interval(Duration::from_millis(250));
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!("{}: Reactor task started", name);

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ReactorCommand::Request { frames, request_id, timeout, response_tx }) => {
                        trace!("{}: Sending request {}", name, request_id);
                        if let Err(e) = socket.send_multipart(frames_to_msgs(&frames)).await {
                            warn!("{}: Send failed for {}: {}", name, request_id, e);
                            let _ = response_tx.send(Err(anyhow!("Send failed: {}", e)));
                            continue;
                        }
                        pending.insert(request_id, PendingRequest {
                            response_tx,
                            deadline: Instant::now() + timeout,
                        });
                    }
                    Some(ReactorCommand::Shutdown) => {
                        info!("{}: Reactor shutting down, failing {} pending requests", name, pending.len());
                        for (_, req) in pending.drain() {
                            let _ = req.response_tx.send(Err(anyhow!("Reactor shutdown")));
                        }
                        break;
                    }
                    None => {
                        debug!("{}: Command channel closed, reactor exiting", name);
                        break;
                    }
                }
            }

            result = socket.recv_multipart() => {
                match result {
                    Ok(msgs) => {
                        let frames = msgs_to_frames(msgs);
                        match BusFrame::from_frames(&frames) {
                            Ok(frame) => {
                                if let Some(req) = pending.remove(&frame.request_id) {
                                    let _ = req.response_tx.send(Ok(frame));
                                } else {
                                    debug!(
                                        "{}: Discarding orphan response for {} ({} pending)",
                                        name, frame.request_id, pending.len()
                                    );
                                }
                            }
                            Err(e) => warn!("{}: Failed to parse response frame: {}", name, e),
                        }
                    }
                    Err(e) => {
                        // ZMQ handles reconnection
                        warn!("{}: Receive error: {}", name, e);
                    }
                }
            }

            _ = cleanup_interval.tick() => {
                let now = Instant::now();
                let expired: Vec<Uuid> = pending
                    .iter()
                    .filter(|(_, req)| now > req.deadline)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(req) = pending.remove(&id) {
                        debug!("{}: Request {} timed out", name, id);
                        let _ = req.response_tx.send(Err(anyhow!("Request timed out")));
                    }
                }
            }
        }
    }

    debug!("{}: Reactor task exiting", name);
}

/// Client for calling objects registered on an iot-ubusd bus.
pub struct BusClient {
    config: ClientConfig,
    cmd_tx: mpsc::Sender<ReactorCommand>,
    /// ZMQ context must outlive the socket
    #[allow(dead_code)]
    context: rzmq::Context,
}

impl BusClient {
    /// Create the DEALER socket and spawn the reactor.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let context = rzmq::Context::new().context("Failed to create ZMQ context")?;
        let identity = format!("{}-{}", config.name, Uuid::new_v4());
        let socket =
            create_dealer_and_connect(&context, &config.endpoint, identity.as_bytes(), &config.name)
                .await?;

        info!("{}: connecting to {}", config.name, config.endpoint);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let reactor_name = config.name.clone();
        tokio::spawn(reactor_task(socket, cmd_rx, reactor_name));

        Ok(Self {
            config,
            cmd_tx,
            context,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Invoke `object.method` with `params`.
    pub async fn call(&self, object: &str, method: &str, params: Value) -> Result<ReplyEnvelope> {
        let call = CallEnvelope::new(object, method, params);
        let frame = self
            .request_with_retry(|id| BusFrame::request(id, &call).map_err(Into::into))
            .await?;
        expect_reply(&frame)?;
        frame.payload().context("Failed to decode reply envelope")
    }

    /// Fetch the registered objects and their method signatures.
    pub async fn list(&self) -> Result<ServiceCatalog> {
        let frame = self.request_with_retry(|id| Ok(BusFrame::list(id))).await?;
        expect_reply(&frame)?;
        frame.payload().context("Failed to decode catalog")
    }

    /// Single liveness probe, no retries.
    pub async fn heartbeat(&self) -> Result<()> {
        let frame = BusFrame::heartbeat();
        let reply = self
            .send_single_request(frame.to_frames(), frame.request_id, self.config.pirate.timeout)
            .await?;
        if reply.command != Command::Heartbeat {
            return Err(anyhow!("Expected Heartbeat, got {:?}", reply.command));
        }
        Ok(())
    }

    /// Send a request, retrying timeouts with a fresh request id per attempt.
    async fn request_with_retry<F>(&self, build: F) -> Result<BusFrame>
    where
        F: Fn(Uuid) -> Result<BusFrame>,
    {
        let pirate = &self.config.pirate;
        let max_attempts = pirate.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request_id = Uuid::new_v4();
            let frames = build(request_id)?.to_frames();

            debug!(
                "{}: Sending request {} (attempt {}/{})",
                self.config.name, request_id, attempt, max_attempts
            );

            match self.send_single_request(frames, request_id, pirate.timeout).await {
                Ok(frame) => return Ok(frame),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "{}: Request {} attempt {} failed: {}, retrying...",
                        self.config.name, request_id, attempt, e
                    );
                    tokio::time::sleep(pirate.backoff_for_attempt(attempt)).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "{}: Request failed after {} attempts",
                        self.config.name, attempt
                    )));
                }
            }
        }
    }

    async fn send_single_request(
        &self,
        frames: Vec<Bytes>,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<BusFrame> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ReactorCommand::Request {
                frames,
                request_id,
                timeout,
                response_tx,
            })
            .await
            .map_err(|_| anyhow!("Reactor channel closed"))?;

        // the reactor expires requests itself; this bound covers a reactor stuck in send
        match tokio::time::timeout(timeout + Duration::from_secs(1), response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("Reactor dropped request {}", request_id)),
            Err(_) => Err(anyhow!("Request {} timed out", request_id)),
        }
    }

    /// Stop the reactor, failing anything still pending.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }
}

fn expect_reply(frame: &BusFrame) -> Result<()> {
    if frame.command != Command::Reply {
        return Err(anyhow!("Expected Reply, got {:?}", frame.command));
    }
    Ok(())
}

//! ZMQ ROUTER server for the local bus.
//!
//! Binds a ROUTER socket and answers UBUS01 frames one at a time:
//! - Request: resolve the binding, run it through the dispatcher
//! - List: the registry catalog
//! - Heartbeat: echoed with the same request id

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use bytes::Bytes;
use rzmq::{Context, Msg, Socket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ubusproto::socket_config::{
    create_router_and_bind, frames_to_msgs, msgs_to_frames, send_multipart_individually,
};
use ubusproto::{BusFrame, CallEnvelope, CallFailure, Command, ReplyEnvelope, PROTOCOL_VERSION};
use uuid::Uuid;

use crate::broker::BrokerStatus;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;

pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5590";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: String,
    /// Socket name in logs
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            name: "iot-ubusd".to_string(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    broker: Option<BrokerStatus>,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Arc<Registry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            registry,
            dispatcher,
            broker: None,
        }
    }

    /// Report broker state in `list` replies.
    pub fn with_broker_status(mut self, status: BrokerStatus) -> Self {
        self.broker = Some(status);
        self
    }

    /// Bind and serve until `cancel` fires. Only a failed bind is an error.
    #[instrument(skip(self, cancel), fields(endpoint = %self.config.endpoint))]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let context = Context::new().context("Failed to create ZMQ context")?;
        let socket = create_router_and_bind(&context, &self.config.endpoint, &self.config.name)
            .await
            .with_context(|| format!("Failed to bind bus endpoint {}", self.config.endpoint))?;

        info!(
            "bus listening on {} ({} objects)",
            self.config.endpoint,
            self.registry.objects().len()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested, stopping bus server");
                    break;
                }
                result = socket.recv_multipart() => {
                    match result {
                        Ok(msgs) => {
                            if let Err(e) = self.handle_message(&socket, msgs).await {
                                error!("Error handling message: {:#}", e);
                            }
                        }
                        Err(e) => error!("Error receiving message: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_message(&self, socket: &Socket, msgs: Vec<Msg>) -> Result<()> {
        let frames = msgs_to_frames(msgs);

        if !frames.iter().any(|f| f.as_ref() == PROTOCOL_VERSION) {
            warn!("Received non-UBUS01 message, ignoring");
            return Ok(());
        }

        let (identity, frame) = BusFrame::from_frames_with_identity(&frames)?;

        debug!(
            "UBUS01 {:?} {}.{} request_id={}",
            frame.command, frame.object, frame.method, frame.request_id
        );

        let response = match frame.command {
            Command::Request => {
                let reply = match frame.to_call() {
                    Ok(call) => self.call(&call).await,
                    Err(e) => {
                        warn!("undecodable request {}: {}", frame.request_id, e);
                        ReplyEnvelope::failure(CallFailure::InvalidRequest)
                    }
                };
                BusFrame::reply(frame.request_id, &reply)?
            }

            Command::List => {
                let state = self.broker.as_ref().map(|s| s.state().as_str());
                BusFrame::reply_json(frame.request_id, &self.registry.catalog(state))?
            }

            Command::Heartbeat => heartbeat_reply(frame.request_id),

            Command::Disconnect => {
                debug!("peer {} disconnected", describe_identity(&identity));
                return Ok(());
            }

            Command::Reply => {
                debug!("Ignoring stray reply {}", frame.request_id);
                return Ok(());
            }
        };

        let reply = frames_to_msgs(&response.to_frames_with_identity(&identity));
        send_multipart_individually(socket, reply).await
    }

    /// Resolve and run one call. Unknown names never reach a backend.
    pub async fn call(&self, call: &CallEnvelope) -> ReplyEnvelope {
        match self.registry.lookup(&call.object, &call.method) {
            Some(binding) => self.dispatcher.call(binding.route, call).await,
            None => {
                debug!("no binding for {}.{}", call.object, call.method);
                ReplyEnvelope::failure(CallFailure::MethodNotFound)
            }
        }
    }
}

fn heartbeat_reply(request_id: Uuid) -> BusFrame {
    BusFrame {
        request_id,
        ..BusFrame::heartbeat()
    }
}

fn describe_identity(identity: &[Bytes]) -> String {
    identity
        .first()
        .map(|id| String::from_utf8_lossy(id).into_owned())
        .unwrap_or_else(|| "<anonymous>".to_string())
}

//! Broker connection manager.
//!
//! Owns the broker link and drives it from two timers:
//!
//! - maintenance (2 s): connect when disconnected, keepalive when connected
//! - poll (20 ms): publish whatever request the mailbox holds
//!
//! Inbound publishes on the response topic go to the mailbox. The manager
//! never waits on the mailbox; callers never see the link.

pub mod keepalive;
pub mod link;
pub mod mqtt;
pub mod packet;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ubusconf::BrokerConfig;

use crate::error::BrokerError;
use crate::mailbox::Mailbox;

pub use keepalive::{Keepalive, KeepaliveAction, PONG_GRACE};
pub use link::{BrokerLink, ConnectOptions, Connector, LinkEvent, Will};
pub use mqtt::MqttConnector;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(2);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl BrokerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BrokerState::Connecting,
            2 => BrokerState::Connected,
            _ => BrokerState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Disconnected => "disconnected",
            BrokerState::Connecting => "connecting",
            BrokerState::Connected => "connected",
        }
    }
}

/// Shared read view of the manager's state.
#[derive(Debug, Clone, Default)]
pub struct BrokerStatus {
    state: Arc<AtomicU8>,
}

impl BrokerStatus {
    pub fn state(&self) -> BrokerState {
        BrokerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: BrokerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Wall-clock milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn wall_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub connect: ConnectOptions,
    pub request_topic: String,
    pub response_topic: String,
    pub keepalive_secs: u64,
    pub maintenance_interval: Duration,
    pub poll_interval: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let keepalive_secs = ubusconf::clamp_keepalive(config.keepalive_secs);
        Self {
            connect: ConnectOptions {
                client_id: config.client_id.clone(),
                keepalive_secs: u16::try_from(keepalive_secs).unwrap_or(u16::MAX),
                clean_session: true,
                will: Some(Will {
                    topic: config.request_topic.clone(),
                    message: config.will_message.clone(),
                }),
            },
            request_topic: config.request_topic.clone(),
            response_topic: config.response_topic.clone(),
            keepalive_secs,
            maintenance_interval: MAINTENANCE_INTERVAL,
            poll_interval: POLL_INTERVAL,
        }
    }
}

enum Step {
    Shutdown,
    Maintain,
    Poll,
    Event(Result<LinkEvent, BrokerError>),
}

pub struct BrokerManager {
    connector: Box<dyn Connector>,
    settings: BrokerSettings,
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
    status: BrokerStatus,
    link: Option<Box<dyn BrokerLink>>,
    keepalive: Keepalive,
    clock: Clock,
}

impl BrokerManager {
    pub fn new(
        connector: Box<dyn Connector>,
        settings: BrokerSettings,
        mailbox: Arc<Mailbox>,
        cancel: CancellationToken,
    ) -> Self {
        let keepalive = Keepalive::new(settings.keepalive_secs);
        Self {
            connector,
            settings,
            mailbox,
            cancel,
            status: BrokerStatus::default(),
            link: None,
            keepalive,
            clock: wall_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn status(&self) -> BrokerStatus {
        self.status.clone()
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut maintenance = tokio::time::interval(self.settings.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "broker manager started for {} (keepalive {}s)",
            self.connector.describe(),
            self.settings.keepalive_secs
        );

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                _ = maintenance.tick() => Step::Maintain,
                event = next_event(&mut self.link) => Step::Event(event),
                _ = poll.tick() => Step::Poll,
            };

            match step {
                Step::Shutdown => break,
                Step::Maintain => self.maintain().await,
                Step::Poll => self.pump_outbound().await,
                Step::Event(event) => self.handle_event(event).await,
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.status.set(BrokerState::Disconnected);
        info!("broker manager stopped");
    }

    async fn maintain(&mut self) {
        if self.link.is_none() {
            self.connect().await;
            return;
        }

        let now = (self.clock)();
        match self.keepalive.check(now) {
            KeepaliveAction::Idle => {}
            KeepaliveAction::Ping => {
                let result = match self.link.as_mut() {
                    Some(link) => link.ping().await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.drop_link(&format!("ping failed: {}", e)).await;
                }
            }
            KeepaliveAction::Expired => self.drop_link("keepalive expired").await,
        }
    }

    async fn connect(&mut self) {
        self.status.set(BrokerState::Connecting);
        debug!("connecting to {}", self.connector.describe());

        let attempt = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("connect abandoned on shutdown");
                self.status.set(BrokerState::Disconnected);
                return;
            }
            attempt = self.connector.connect(&self.settings.connect) => attempt,
        };
        let mut link = match attempt {
            Ok(link) => link,
            Err(e) => {
                warn!("broker connect to {} failed: {}", self.connector.describe(), e);
                self.status.set(BrokerState::Disconnected);
                return;
            }
        };

        let subscribed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                link.close().await;
                self.status.set(BrokerState::Disconnected);
                return;
            }
            subscribed = link.subscribe(&self.settings.response_topic) => subscribed,
        };
        if let Err(e) = subscribed {
            warn!("subscribe to {} failed: {}", self.settings.response_topic, e);
            link.close().await;
            self.status.set(BrokerState::Disconnected);
            return;
        }

        self.keepalive.reset((self.clock)());
        self.link = Some(link);
        self.status.set(BrokerState::Connected);
        info!(
            "connected to {}, subscribed to {}",
            self.connector.describe(),
            self.settings.response_topic
        );
    }

    async fn pump_outbound(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(request) = self.mailbox.try_take_request() else {
            return;
        };

        debug!("publish {} bytes -> {}", request.len(), self.settings.request_topic);
        if let Err(e) = link.publish(&self.settings.request_topic, &request).await {
            self.drop_link(&format!("publish failed: {}", e)).await;
        }
    }

    async fn handle_event(&mut self, event: Result<LinkEvent, BrokerError>) {
        match event {
            Ok(LinkEvent::Message { topic, payload }) => {
                if topic != self.settings.response_topic {
                    debug!("ignoring message on {}", topic);
                    return;
                }
                debug!("received {} bytes <- {}", payload.len(), topic);
                self.mailbox.offer_response(payload);
            }
            Ok(LinkEvent::Pong) => self.keepalive.pong((self.clock)()),
            Ok(LinkEvent::Subscribed) => debug!("subscription acknowledged"),
            Ok(LinkEvent::Closed) => self.drop_link("closed by broker").await,
            Err(e) => self.drop_link(&e.to_string()).await,
        }
    }

    async fn drop_link(&mut self, reason: &str) {
        if let Some(mut link) = self.link.take() {
            info!("broker connection closed: {}", reason);
            link.close().await;
        }
        self.status.set(BrokerState::Disconnected);
    }
}

async fn next_event(link: &mut Option<Box<dyn BrokerLink>>) -> Result<LinkEvent, BrokerError> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_u8() {
        for state in [
            BrokerState::Disconnected,
            BrokerState::Connecting,
            BrokerState::Connected,
        ] {
            assert_eq!(BrokerState::from_u8(state as u8), state);
        }
        assert_eq!(BrokerState::from_u8(200), BrokerState::Disconnected);
    }

    #[test]
    fn settings_from_config() {
        let config = BrokerConfig {
            keepalive_secs: 2,
            ..BrokerConfig::default()
        };
        let settings = BrokerSettings::from_config(&config);
        assert_eq!(settings.keepalive_secs, 5);
        assert_eq!(settings.connect.keepalive_secs, 5);
        assert!(settings.connect.clean_session);
        assert_eq!(
            settings.connect.will,
            Some(Will {
                topic: "mg/iot-ubusd/channel/iot-rpcd".to_string(),
                message: "goodbye".to_string(),
            })
        );
        assert_eq!(settings.response_topic, "mg/iot-ubusd/channel");
    }
}

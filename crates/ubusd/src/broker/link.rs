//! Transport seam between the connection manager and an actual broker.

use async_trait::async_trait;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    /// 0 disables broker-side keepalive
    pub keepalive_secs: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message { topic: String, payload: String },
    Pong,
    Subscribed,
    /// Peer closed the connection
    Closed,
}

/// One established broker session.
#[async_trait]
pub trait BrokerLink: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// QoS 0, not retained.
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    async fn ping(&mut self) -> Result<(), BrokerError>;

    /// Must be cancel safe: the manager drops it whenever a timer fires.
    async fn next_event(&mut self) -> Result<LinkEvent, BrokerError>;

    async fn close(&mut self);
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the broker accepted the session.
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, BrokerError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

//! In-memory broker for driving `BrokerManager` without a network.
//!
//! Every accepted connection becomes a [`FakeSession`] handed to the test,
//! which sees what the manager sent (`ops`) and injects what the broker
//! would deliver (`events`).

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use ubusd::broker::{BrokerLink, Clock, ConnectOptions, Connector, LinkEvent};
use ubusd::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Subscribe(String),
    Publish { topic: String, payload: String },
    Ping,
    Close,
}

pub struct FakeSession {
    pub options: ConnectOptions,
    pub ops: mpsc::UnboundedReceiver<Op>,
    pub events: mpsc::UnboundedSender<Result<LinkEvent, BrokerError>>,
}

impl FakeSession {
    pub async fn next_op(&mut self) -> Op {
        self.ops.recv().await.expect("link dropped without closing")
    }

    pub fn deliver(&self, topic: &str, payload: &str) {
        self.events
            .send(Ok(LinkEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            }))
            .expect("manager dropped the link");
    }

    pub fn send(&self, event: LinkEvent) {
        self.events.send(Ok(event)).expect("manager dropped the link");
    }
}

pub struct FakeConnector {
    attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    sessions: mpsc::UnboundedSender<FakeSession>,
}

/// Test-side view of the connector.
pub struct FakeBroker {
    pub attempts: Arc<AtomicUsize>,
    pub failures: Arc<AtomicUsize>,
    pub sessions: mpsc::UnboundedReceiver<FakeSession>,
}

impl FakeBroker {
    pub async fn next_session(&mut self) -> FakeSession {
        self.sessions.recv().await.expect("connector dropped")
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub fn fake_broker() -> (FakeConnector, FakeBroker) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FakeConnector {
            attempts: Arc::clone(&attempts),
            failures: Arc::clone(&failures),
            sessions: tx,
        },
        FakeBroker {
            attempts,
            failures,
            sessions: rx,
        },
    )
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Refused("server unavailable".to_string()));
        }

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = FakeSession {
            options: options.clone(),
            ops: ops_rx,
            events: events_tx,
        };
        self.sessions.send(session).map_err(|_| BrokerError::Closed)?;

        Ok(Box::new(FakeLink {
            ops: ops_tx,
            events: events_rx,
        }))
    }

    fn describe(&self) -> String {
        "fake broker".to_string()
    }
}

struct FakeLink {
    ops: mpsc::UnboundedSender<Op>,
    events: mpsc::UnboundedReceiver<Result<LinkEvent, BrokerError>>,
}

impl FakeLink {
    fn record(&self, op: Op) -> Result<(), BrokerError> {
        self.ops.send(op).map_err(|_| BrokerError::Closed)
    }
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.record(Op::Subscribe(topic.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        self.record(Op::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
    }

    async fn ping(&mut self) -> Result<(), BrokerError> {
        self.record(Op::Ping)
    }

    async fn next_event(&mut self) -> Result<LinkEvent, BrokerError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Ok(LinkEvent::Closed),
        }
    }

    async fn close(&mut self) {
        let _ = self.record(Op::Close);
    }
}

/// A wall clock the test moves by hand.
pub fn manual_clock() -> (Clock, Arc<AtomicI64>) {
    let now = Arc::new(AtomicI64::new(0));
    let reader = Arc::clone(&now);
    (Arc::new(move || reader.load(Ordering::SeqCst)), now)
}

//! Single-slot request/response exchange between the bus and the broker.
//!
//! One round-trip at a time system-wide:
//!
//! ```text
//! caller                           broker task (poll tick)
//!   take turn
//!   wait request slot empty
//!   put request      ──────────►   try_take_request() → publish
//!   wait response (bounded)        inbound publish → offer_response()
//!   take response    ◄──────────
//!   release turn
//! ```
//!
//! The broker side never waits: it drains or fills a slot if it can and
//! moves on. An undelivered response is never overwritten.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::MailboxError;

/// Default bound on the wait for a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    Empty,
    RequestPending,
    ResponsePending,
    Closed,
}

impl MailboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxState::Empty => "empty",
            MailboxState::RequestPending => "request_pending",
            MailboxState::ResponsePending => "response_pending",
            MailboxState::Closed => "closed",
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    request: Option<String>,
    response: Option<String>,
}

pub struct Mailbox {
    slots: Mutex<Slots>,
    request_drained: Notify,
    response_ready: Notify,
    /// Held by the caller for its whole round-trip
    turn: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    response_timeout: Duration,
}

impl Mailbox {
    pub fn new(response_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            request_drained: Notify::new(),
            response_ready: Notify::new(),
            turn: tokio::sync::Mutex::new(()),
            cancel,
            response_timeout,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn state(&self) -> MailboxState {
        if self.cancel.is_cancelled() {
            return MailboxState::Closed;
        }
        let slots = self.slots.lock().expect("mailbox mutex poisoned");
        if slots.request.is_some() {
            MailboxState::RequestPending
        } else if slots.response.is_some() {
            MailboxState::ResponsePending
        } else {
            MailboxState::Empty
        }
    }

    /// Abort every wait, now and later.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hand `request` to the broker and wait for the peer's answer.
    pub async fn round_trip(&self, request: String) -> Result<String, MailboxError> {
        let _turn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(MailboxError::Closed),
            guard = self.turn.lock() => guard,
        };

        self.put_request(request).await?;

        let result = self.await_response().await;
        if result.is_err() {
            self.withdraw_request();
        }
        result
    }

    async fn put_request(&self, request: String) -> Result<(), MailboxError> {
        let mut request = Some(request);
        loop {
            {
                let mut slots = self.slots.lock().expect("mailbox mutex poisoned");
                if slots.request.is_none() {
                    if let Some(stale) = slots.response.take() {
                        debug!("discarding stale response ({} bytes)", stale.len());
                    }
                    slots.request = request.take();
                    trace!("request queued");
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(MailboxError::Closed),
                _ = self.request_drained.notified() => {}
            }
        }
    }

    async fn await_response(&self) -> Result<String, MailboxError> {
        let deadline = tokio::time::Instant::now() + self.response_timeout;
        loop {
            let ready = self
                .slots
                .lock()
                .expect("mailbox mutex poisoned")
                .response
                .take();
            if let Some(response) = ready {
                return Ok(response);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(MailboxError::Closed),
                _ = self.response_ready.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("no response within {:?}", self.response_timeout);
                    return Err(MailboxError::Timeout(self.response_timeout));
                }
            }
        }
    }

    /// An abandoned request is not published late.
    fn withdraw_request(&self) {
        let mut slots = self.slots.lock().expect("mailbox mutex poisoned");
        if slots.request.take().is_some() {
            debug!("withdrew undelivered request");
        }
    }

    /// Broker side: take the pending request, if any.
    pub fn try_take_request(&self) -> Option<String> {
        let request = self
            .slots
            .lock()
            .expect("mailbox mutex poisoned")
            .request
            .take();
        if request.is_some() {
            self.request_drained.notify_one();
        }
        request
    }

    /// Broker side: store an inbound response unless one is already waiting.
    /// Returns false when the response was dropped.
    pub fn offer_response(&self, response: String) -> bool {
        {
            let mut slots = self.slots.lock().expect("mailbox mutex poisoned");
            if slots.response.is_some() {
                warn!("response slot full, dropping {} bytes", response.len());
                return false;
            }
            slots.response = Some(response);
        }
        self.response_ready.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mailbox(timeout: Duration) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(timeout, CancellationToken::new()))
    }

    /// Poll until the broker side can see a request.
    async fn take_request(mailbox: &Mailbox) -> String {
        loop {
            if let Some(request) = mailbox.try_take_request() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let mb = mailbox(Duration::from_secs(2));
        assert_eq!(mb.state(), MailboxState::Empty);

        let caller = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.round_trip("ping".to_string()).await })
        };

        assert_eq!(take_request(&mb).await, "ping");
        assert!(mb.offer_response("pong".to_string()));

        assert_eq!(caller.await.unwrap(), Ok("pong".to_string()));
        assert_eq!(mb.state(), MailboxState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_and_withdraws() {
        let mb = mailbox(DEFAULT_RESPONSE_TIMEOUT);
        let start = tokio::time::Instant::now();

        let result = mb.round_trip("lost".to_string()).await;
        assert_eq!(result, Err(MailboxError::Timeout(DEFAULT_RESPONSE_TIMEOUT)));
        assert!(start.elapsed() >= DEFAULT_RESPONSE_TIMEOUT);
        assert!(start.elapsed() < DEFAULT_RESPONSE_TIMEOUT + Duration::from_millis(20));

        // never drained, so nothing is left to publish
        assert_eq!(mb.try_take_request(), None);
        assert_eq!(mb.state(), MailboxState::Empty);
    }

    #[test]
    fn test_response_slot_not_overwritten() {
        let mb = mailbox(DEFAULT_RESPONSE_TIMEOUT);
        assert!(mb.offer_response("first".to_string()));
        assert!(!mb.offer_response("second".to_string()));
        assert_eq!(mb.state(), MailboxState::ResponsePending);
    }

    #[tokio::test]
    async fn test_stale_response_discarded_on_next_request() {
        let mb = mailbox(Duration::from_secs(2));
        assert!(mb.offer_response("late".to_string()));

        let caller = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.round_trip("fresh".to_string()).await })
        };

        assert_eq!(take_request(&mb).await, "fresh");
        assert!(mb.offer_response("answer".to_string()));
        assert_eq!(caller.await.unwrap(), Ok("answer".to_string()));
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_first() {
        let mb = mailbox(Duration::from_secs(2));

        let first = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.round_trip("one".to_string()).await })
        };
        assert_eq!(take_request(&mb).await, "one");

        let second = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.round_trip("two".to_string()).await })
        };

        // the second request must not appear while the first is in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mb.try_take_request(), None);

        assert!(mb.offer_response("reply-one".to_string()));
        assert_eq!(first.await.unwrap(), Ok("reply-one".to_string()));

        assert_eq!(take_request(&mb).await, "two");
        assert!(mb.offer_response("reply-two".to_string()));
        assert_eq!(second.await.unwrap(), Ok("reply-two".to_string()));
    }

    #[tokio::test]
    async fn test_close_aborts_waits() {
        let mb = mailbox(Duration::from_secs(60));

        let caller = {
            let mb = Arc::clone(&mb);
            tokio::spawn(async move { mb.round_trip("pending".to_string()).await })
        };
        assert_eq!(take_request(&mb).await, "pending");

        mb.close();
        let result = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(MailboxError::Closed));
        assert_eq!(mb.state(), MailboxState::Closed);

        assert_eq!(
            mb.round_trip("after".to_string()).await,
            Err(MailboxError::Closed)
        );
    }
}

//! Call dispatcher: the one entry point for every registered method.
//!
//! Whatever happens in a backend, the caller gets a [`ReplyEnvelope`]:
//! backend text that parses as JSON becomes the reply data, everything else
//! becomes one of the fixed failure reasons.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use ubusproto::{CallEnvelope, CallFailure, ReplyEnvelope};

use crate::mailbox::Mailbox;
use crate::registry::Route;
use crate::script::{ScriptBackend, DEFAULT_CALLABLE};

/// `{"method":"call","params":[module, function, {object, method, data}]}`
#[derive(Debug, Serialize)]
struct RemoteRequest<'a> {
    method: &'static str,
    params: (&'a str, &'a str, RemoteCall<'a>),
}

#[derive(Debug, Serialize)]
struct RemoteCall<'a> {
    object: &'a str,
    method: &'a str,
    data: &'a Value,
}

/// Remote peer reached through the mailbox and the broker.
pub struct RemoteBridge {
    mailbox: Arc<Mailbox>,
    module: String,
    function: String,
}

impl RemoteBridge {
    pub fn new(mailbox: Arc<Mailbox>, module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            mailbox,
            module: module.into(),
            function: function.into(),
        }
    }

    /// Wrap an ordinary call so one generic remote entry point can serve
    /// every local object.
    pub fn wrap(&self, call: &CallEnvelope) -> String {
        let request = RemoteRequest {
            method: "call",
            params: (
                &self.module,
                &self.function,
                RemoteCall {
                    object: &call.object,
                    method: &call.method,
                    data: &call.params,
                },
            ),
        };
        // a struct of strings and a Value always serializes
        serde_json::to_string(&request).unwrap_or_default()
    }

    async fn send(&self, request: String) -> Result<String, CallFailure> {
        self.mailbox.round_trip(request).await.map_err(|e| {
            warn!(
                "remote call failed: {} (mailbox {})",
                e,
                self.mailbox.state().as_str()
            );
            e.failure()
        })
    }
}

pub struct Dispatcher {
    script: ScriptBackend,
    remote: Option<RemoteBridge>,
}

impl Dispatcher {
    pub fn new(script: ScriptBackend, remote: Option<RemoteBridge>) -> Self {
        Self { script, remote }
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Run one call along its route. Never fails.
    #[instrument(skip(self, call), fields(object = %call.object, method = %call.method, route = %route))]
    pub async fn call(&self, route: Route, call: &CallEnvelope) -> ReplyEnvelope {
        let outcome = match route {
            Route::EmbeddedScript => self
                .script
                .call_object(&call.object, &call.method, &call.params_text())
                .await
                .map_err(|e| e.failure()),

            Route::RemoteBridge => match &self.remote {
                Some(remote) => remote.send(remote.wrap(call)).await,
                None => {
                    warn!("remote route without a broker bridge");
                    Err(CallFailure::NoData)
                }
            },

            Route::Introspection => match &self.remote {
                Some(remote) => remote.send(call.params_text()).await,
                None => {
                    let function = call.embedded_method().unwrap_or(DEFAULT_CALLABLE);
                    self.script
                        .call_rpc(function, &call.params_text())
                        .await
                        .map_err(|e| e.failure())
                }
            },
        };

        match outcome {
            Ok(text) => reply_from_text(&text),
            Err(reason) => ReplyEnvelope::failure(reason),
        }
    }
}

/// Backend text to reply. Empty or non-JSON text carries no data.
pub fn reply_from_text(text: &str) -> ReplyEnvelope {
    if text.trim().is_empty() {
        return ReplyEnvelope::failure(CallFailure::NoData);
    }
    match serde_json::from_str::<Value>(text) {
        Ok(data) => {
            debug!("reply {} bytes", text.len());
            ReplyEnvelope::ok(data)
        }
        Err(e) => {
            warn!("backend reply is not JSON: {}", e);
            ReplyEnvelope::failure(CallFailure::NoData)
        }
    }
}

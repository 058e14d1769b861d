//! Call and reply envelopes.
//!
//! A reply is never empty: a call either yields backend data (status 0) or a
//! fixed error object `{"code": -1, "message": <reason>}` (status -1).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Status of a successful call.
pub const STATUS_OK: i32 = 0;

/// Status and error-object code of a failed call.
pub const STATUS_ERROR: i32 = -1;

/// One invocation of `object.method` with its parameter payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub object: String,
    pub method: String,
    pub params: Value,
}

impl CallEnvelope {
    pub fn new(object: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            object: object.into(),
            method: method.into(),
            params,
        }
    }

    /// Compact JSON text of the params, as handed to backends.
    pub fn params_text(&self) -> String {
        self.params.to_string()
    }

    /// The `method` field of a self-describing payload, if present.
    pub fn embedded_method(&self) -> Option<&str> {
        self.params.get("method").and_then(Value::as_str)
    }
}

/// Why a call produced no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// The script resource could not be loaded
    CallbackNotFound,
    /// The script has no callable by the requested name
    MethodUnsupported,
    /// The callable raised, timed out or crashed
    CallFailed,
    /// The callable returned nothing textual
    NoResponse,
    /// No backend result, including remote timeouts
    NoData,
    /// No object/method registered under that name
    MethodNotFound,
    /// The request frame could not be decoded
    InvalidRequest,
}

impl CallFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallFailure::CallbackNotFound => "callback not found",
            CallFailure::MethodUnsupported => "method is unsupported",
            CallFailure::CallFailed => "call failed",
            CallFailure::NoResponse => "no response",
            CallFailure::NoData => "no data",
            CallFailure::MethodNotFound => "method not found",
            CallFailure::InvalidRequest => "invalid request",
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed-shape error object carried in a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub status: i32,
    pub data: Value,
}

impl ReplyEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            status: STATUS_OK,
            data,
        }
    }

    pub fn failure(reason: CallFailure) -> Self {
        Self {
            status: STATUS_ERROR,
            data: serde_json::json!({ "code": STATUS_ERROR, "message": reason.as_str() }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// The error message of a failed reply.
    pub fn error_message(&self) -> Option<&str> {
        if self.is_ok() {
            return None;
        }
        self.data.get("message").and_then(Value::as_str)
    }

    /// Decode the error object of a failed reply.
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.is_ok() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn failure_shape() {
        let reply = ReplyEnvelope::failure(CallFailure::MethodUnsupported);
        assert_eq!(reply.status, -1);
        assert_eq!(reply.data, json!({"code": -1, "message": "method is unsupported"}));
        assert_eq!(reply.error_message(), Some("method is unsupported"));
        assert_eq!(
            reply.error_body(),
            Some(ErrorBody {
                code: -1,
                message: "method is unsupported".to_string()
            })
        );
    }

    #[test]
    fn ok_has_no_error_message() {
        let reply = ReplyEnvelope::ok(json!({"message": "not an error"}));
        assert!(reply.is_ok());
        assert_eq!(reply.error_message(), None);
    }

    #[test]
    fn failure_messages_are_fixed() {
        let all = [
            (CallFailure::CallbackNotFound, "callback not found"),
            (CallFailure::MethodUnsupported, "method is unsupported"),
            (CallFailure::CallFailed, "call failed"),
            (CallFailure::NoResponse, "no response"),
            (CallFailure::NoData, "no data"),
        ];
        for (failure, text) in all {
            assert_eq!(failure.to_string(), text);
        }
    }

    #[test]
    fn embedded_method() {
        let call = CallEnvelope::new("iot-ubusd", "iot-rpc", json!({"method": "foo", "params": []}));
        assert_eq!(call.embedded_method(), Some("foo"));

        let call = CallEnvelope::new("iot-ubusd", "iot-rpc", json!({"method": 7}));
        assert_eq!(call.embedded_method(), None);
    }

    #[test]
    fn params_text_is_compact() {
        let call = CallEnvelope::new("lamp", "on", json!({}));
        assert_eq!(call.params_text(), "{}");
    }
}

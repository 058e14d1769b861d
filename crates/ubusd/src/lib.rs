//! iot-ubusd: bus objects backed by Lua scripts or a remote MQTT peer.
//!
//! Objects and their methods come from a JSON document. Every method is bound
//! to one dispatcher entry point with a route fixed at registration:
//!
//! - **script**: the callback script runs in-process, fresh on every call
//! - **remote**: the call is wrapped and published through the broker, and
//!   the caller waits (bounded) for the single answer
//! - **introspection**: `iot-ubusd.iot-rpc`, whose payload names its own
//!   target method
//!
//! Callers always get a reply: backend data, or a fixed error object.

pub mod broker;
pub mod dispatch;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod schema;
pub mod script;
pub mod server;
pub mod telemetry;

pub use broker::{BrokerManager, BrokerSettings, BrokerState, BrokerStatus, MqttConnector};
pub use dispatch::{Dispatcher, RemoteBridge};
pub use error::{BrokerError, MailboxError, RegistryError, ScriptError};
pub use mailbox::{Mailbox, MailboxState};
pub use registry::{Registry, Route, INTROSPECTION_METHOD, INTROSPECTION_OBJECT};
pub use schema::{load_objects, ObjectSchema};
pub use script::{ScriptBackend, ScriptConfig};
pub use server::{Server, ServerConfig};

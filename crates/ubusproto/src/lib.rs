//! Wire types for the iot-ubusd local bus.
//!
//! - [`frame`]: the UBUS01 multipart frame format
//! - [`envelope`]: call and reply envelopes, fixed failure reasons
//! - [`catalog`]: object/method/parameter descriptors returned by List
//! - [`client`] (feature `peer`): DEALER client with Lazy Pirate retries

pub mod catalog;
pub mod envelope;
pub mod frame;
pub mod lazy_pirate;

#[cfg(feature = "peer")]
pub mod client;
#[cfg(feature = "peer")]
pub mod socket_config;

pub use catalog::{MethodDescriptor, ObjectDescriptor, ParamDescriptor, ParamKind, ServiceCatalog};
pub use envelope::{CallEnvelope, CallFailure, ErrorBody, ReplyEnvelope, STATUS_ERROR, STATUS_OK};
pub use frame::{BusFrame, Command, ContentType, FrameError, FRAME_COUNT, PROTOCOL_VERSION};
pub use lazy_pirate::LazyPirateConfig;

#[cfg(feature = "peer")]
pub use client::{BusClient, ClientConfig};

//! Message routing for qbus.
//!
//! This is the application-facing layer: modules register named methods,
//! call each other's methods by name (in-process or over a
//! [`qbus_transport`] provider), and broadcast observable values. A
//! handler may delegate to further calls through the continuation model
//! while its caller still sees exactly one response, correlated end to
//! end by the envelope's chain key.

pub mod bus;
pub mod config;
pub mod error;
pub mod message;
pub mod payload;
pub mod roles;

pub use bus::{Bus, Handler, Responder};
pub use config::{ProviderConfig, ProviderKind, ProviderMode};
pub use error::{Result, RouterError};
pub use message::{err_code, CallError, Message};
pub use payload::PayloadFilter;
pub use roles::{role_any, role_has};

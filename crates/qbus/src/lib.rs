//! Distributed process bus.
//!
//! qbus lets independent modules (processes) register named methods and
//! call each other's methods by name, in-process or over TCP, through a
//! uniform request/response envelope with routing metadata, public and
//! private payloads, and an optional binary blob.
//!
//! # Crate Structure
//!
//! - [`transport`] — TCP socket multiplexing, wake pipe, reconnect queue
//! - [`frame`] — Separator-delimited wire framing (resumable decoder)
//! - [`router`] — Envelope, method routing, continuations (behind the
//!   `router` feature)

/// Re-export transport types.
pub mod transport {
    pub use qbus_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use qbus_frame::*;
}

/// Re-export router types (requires `router` feature).
#[cfg(feature = "router")]
pub mod router {
    pub use qbus_router::*;
}

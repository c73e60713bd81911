//! TCP transport provider for qbus.
//!
//! One background thread per provider multiplexes every socket of a bus
//! context through a blocking `poll(2)` loop, interrupted by an explicit
//! wake pipe carrying typed control signals. Lost outbound connections
//! whose endpoint asks for it are retried on the poll tick.
//!
//! This is the lowest networked layer of qbus: it moves [`qbus_frame`]
//! frames between sockets and an event sink and knows nothing about
//! envelopes or routing.

pub mod endpoint;
pub mod error;
pub mod handle;
pub mod net;
pub mod provider;
pub mod wake;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use handle::{ConnectionId, HandleKind};
pub use provider::{TcpProvider, TransportEvents, POLL_TIMEOUT};
pub use wake::{WakePipe, WakeSignal};

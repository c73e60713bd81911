//! Separator-delimited message framing for the qbus wire protocol.
//!
//! One logical message is framed as:
//!
//! ```text
//! #<kind>!<chain_key>#<module>|<method>|<sender>#<payload_kind>|<payload_len>|<payload>
//! ```
//!
//! The decoder is a resumable state machine: it accepts input in chunks of
//! any size (down to one byte per call) and keeps partial accumulation
//! across calls, so it can be fed straight from non-blocking socket reads.

pub mod codec;
pub mod error;
pub mod frame;
pub mod reader;
pub mod writer;

pub use codec::{encode_frame, FeedResult, FrameDecoder, DEFAULT_MAX_PAYLOAD};
pub use error::{FrameError, Result};
pub use frame::{Frame, FrameKind, PayloadKind};
pub use reader::FrameReader;
pub use writer::FrameWriter;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A routing field contains one of the reserved separator characters.
    /// The wire format has no escaping mechanism.
    #[error("field `{field}` contains a reserved separator character (#, ! or |)")]
    SeparatorInField { field: &'static str },

    /// The frame kind value is not part of the protocol.
    #[error("unknown frame kind {0}")]
    UnknownKind(u64),

    /// The payload kind value is not part of the protocol.
    #[error("unknown payload kind {0}")]
    UnknownPayloadKind(u64),

    /// A numeric header field did not parse as a decimal integer.
    #[error("field `{field}` is not a decimal integer")]
    BadInteger { field: &'static str },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors that can occur in router operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] qbus_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] qbus_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 payload filter error.
    #[error("payload filter error: {0}")]
    Filter(#[from] base64::DecodeError),

    /// No connection is known for the target module.
    #[error("no route to module `{0}`")]
    NoRoute(String),

    /// A message carries both a binary blob and structured payload
    /// fields; the wire format holds one or the other.
    #[error("message mixes a blob with structured payload fields")]
    MixedPayload,

    /// The bus has been shut down.
    #[error("bus shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RouterError>;

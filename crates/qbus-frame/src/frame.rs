use bytes::Bytes;

use crate::error::{FrameError, Result};

/// The kind of a wire frame.
///
/// Every value the protocol defines is listed here; decoding any other
/// wire value is an error rather than a silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Placeholder, never sent by a healthy peer.
    None,
    /// Route table request, sent once per new connection.
    RouteReq,
    /// Route table response.
    RouteRes,
    /// Method call request.
    MsgReq,
    /// Method call response.
    MsgRes,
    /// Route table broadcast after a routing change.
    RouteUpd,
    /// Method listing request/response.
    Methods,
    /// Observable subscription request.
    ObservableReq,
    /// Observable value broadcast.
    ObservableRes,
}

impl FrameKind {
    /// Wire value of this kind.
    pub fn wire(self) -> u8 {
        match self {
            FrameKind::None => 0,
            FrameKind::RouteReq => 1,
            FrameKind::RouteRes => 2,
            FrameKind::MsgReq => 3,
            FrameKind::MsgRes => 4,
            FrameKind::RouteUpd => 5,
            FrameKind::Methods => 6,
            FrameKind::ObservableReq => 7,
            FrameKind::ObservableRes => 8,
        }
    }

    /// Parse a wire value.
    pub fn from_wire(value: u64) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::None),
            1 => Ok(FrameKind::RouteReq),
            2 => Ok(FrameKind::RouteRes),
            3 => Ok(FrameKind::MsgReq),
            4 => Ok(FrameKind::MsgRes),
            5 => Ok(FrameKind::RouteUpd),
            6 => Ok(FrameKind::Methods),
            7 => Ok(FrameKind::ObservableReq),
            8 => Ok(FrameKind::ObservableRes),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// How the payload bytes of a frame are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// No payload.
    None,
    /// JSON text (possibly base64-filtered by the layer above).
    Json,
    /// File/blob content.
    File,
}

impl PayloadKind {
    /// Wire value of this payload kind.
    pub fn wire(self) -> u8 {
        match self {
            PayloadKind::None => 0,
            PayloadKind::Json => 1,
            PayloadKind::File => 2,
        }
    }

    /// Parse a wire value.
    pub fn from_wire(value: u64) -> Result<Self> {
        match value {
            0 => Ok(PayloadKind::None),
            1 => Ok(PayloadKind::Json),
            2 => Ok(PayloadKind::File),
            other => Err(FrameError::UnknownPayloadKind(other)),
        }
    }
}

/// One complete wire message.
///
/// `chain_key` correlates a request with every response that eventually
/// completes it, across any number of continuation hops. `module`,
/// `method`, `sender` and `chain_key` must not contain the separator
/// characters `#`, `!` or `|`; [`crate::encode_frame`] rejects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub chain_key: String,
    pub module: String,
    pub method: String,
    pub sender: String,
    pub payload_kind: PayloadKind,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with empty routing fields and no payload.
    pub fn new(kind: FrameKind, chain_key: impl Into<String>) -> Self {
        Self {
            kind,
            chain_key: chain_key.into(),
            module: String::new(),
            method: String::new(),
            sender: String::new(),
            payload_kind: PayloadKind::None,
            payload: Bytes::new(),
        }
    }

    /// Set target module and method.
    pub fn with_target(mut self, module: impl Into<String>, method: impl Into<String>) -> Self {
        self.module = module.into();
        self.method = method.into();
        self
    }

    /// Set the origin module.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, kind: PayloadKind, payload: impl Into<Bytes>) -> Self {
        self.payload_kind = kind;
        self.payload = payload.into();
        self
    }

    /// Attach a JSON payload.
    pub fn with_json(self, payload: impl Into<Bytes>) -> Self {
        self.with_payload(PayloadKind::Json, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_wire_values_roundtrip() {
        for value in 0..=8u64 {
            let kind = FrameKind::from_wire(value).unwrap();
            assert_eq!(u64::from(kind.wire()), value);
        }
    }

    #[test]
    fn unknown_frame_kind_rejected() {
        assert!(matches!(
            FrameKind::from_wire(9),
            Err(FrameError::UnknownKind(9))
        ));
    }

    #[test]
    fn unknown_payload_kind_rejected() {
        assert!(matches!(
            PayloadKind::from_wire(3),
            Err(FrameError::UnknownPayloadKind(3))
        ));
    }

    #[test]
    fn builders_fill_fields() {
        let frame = Frame::new(FrameKind::MsgReq, "ck-1")
            .with_target("AUTH", "login")
            .with_sender("JOBS")
            .with_json(&b"{}"[..]);

        assert_eq!(frame.kind, FrameKind::MsgReq);
        assert_eq!(frame.chain_key, "ck-1");
        assert_eq!(frame.module, "AUTH");
        assert_eq!(frame.method, "login");
        assert_eq!(frame.sender, "JOBS");
        assert_eq!(frame.payload_kind, PayloadKind::Json);
        assert_eq!(frame.payload.as_ref(), b"{}");
    }
}

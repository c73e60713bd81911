use bytes::Bytes;
use serde_json::Value;

/// Error carried by a failed call, reconstructed on the caller side from
/// the response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub code: i64,
    pub text: String,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.text)
    }
}

/// Well-known call error codes.
pub mod err_code {
    /// Unspecified failure.
    pub const GENERAL: i64 = 1;
    /// The target module has no such method.
    pub const METHOD_NOT_FOUND: i64 = 2;
    /// No connection is known for the target module.
    pub const NO_ROUTE: i64 = 3;
    /// The call could not be sent.
    pub const SEND_FAILED: i64 = 4;
}

/// The application-facing request/response envelope.
///
/// Sub-objects have exactly one owner at a time: they move out of the
/// envelope through the `take_*` methods and are duplicated only by an
/// explicit `clone` of the returned value. `cdata` is the public payload
/// visible to the remote peer; `pdata` travels on the wire too but by
/// convention carries internal routing detail rather than request data;
/// `rinfo` is propagated trust context the core never verifies.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Correlation id linking this envelope to its (possibly multi-hop)
    /// counterpart. Assigned by the router when empty.
    pub chain_key: String,
    /// Module the envelope originated from.
    pub sender: String,
    cdata: Option<Value>,
    pdata: Option<Value>,
    clist: Option<Vec<Value>>,
    rinfo: Option<Value>,
    files: Option<Value>,
    blob: Option<Bytes>,
    err: Option<CallError>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// An envelope carrying only an error.
    pub fn from_error(code: i64, text: impl Into<String>) -> Self {
        let mut msg = Self::new();
        msg.set_error(code, text);
        msg
    }

    pub fn with_cdata(mut self, value: Value) -> Self {
        self.cdata = Some(value);
        self
    }

    pub fn with_pdata(mut self, value: Value) -> Self {
        self.pdata = Some(value);
        self
    }

    pub fn with_clist(mut self, values: Vec<Value>) -> Self {
        self.clist = Some(values);
        self
    }

    pub fn with_rinfo(mut self, value: Value) -> Self {
        self.rinfo = Some(value);
        self
    }

    pub fn with_files(mut self, value: Value) -> Self {
        self.files = Some(value);
        self
    }

    pub fn with_blob(mut self, blob: impl Into<Bytes>) -> Self {
        self.blob = Some(blob.into());
        self
    }

    pub fn set_cdata(&mut self, value: Value) {
        self.cdata = Some(value);
    }

    pub fn set_pdata(&mut self, value: Value) {
        self.pdata = Some(value);
    }

    pub fn set_clist(&mut self, values: Vec<Value>) {
        self.clist = Some(values);
    }

    pub fn set_rinfo(&mut self, value: Value) {
        self.rinfo = Some(value);
    }

    pub fn set_files(&mut self, value: Value) {
        self.files = Some(value);
    }

    pub fn set_blob(&mut self, blob: impl Into<Bytes>) {
        self.blob = Some(blob.into());
    }

    pub fn set_error(&mut self, code: i64, text: impl Into<String>) {
        self.err = Some(CallError {
            code,
            text: text.into(),
        });
    }

    pub fn cdata(&self) -> Option<&Value> {
        self.cdata.as_ref()
    }

    pub fn pdata(&self) -> Option<&Value> {
        self.pdata.as_ref()
    }

    pub fn clist(&self) -> Option<&[Value]> {
        self.clist.as_deref()
    }

    pub fn rinfo(&self) -> Option<&Value> {
        self.rinfo.as_ref()
    }

    pub fn files(&self) -> Option<&Value> {
        self.files.as_ref()
    }

    pub fn blob(&self) -> Option<&Bytes> {
        self.blob.as_ref()
    }

    /// The call error, if the call failed. Check this before trusting
    /// `cdata`.
    pub fn err(&self) -> Option<&CallError> {
        self.err.as_ref()
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// Move the public payload out of the envelope.
    pub fn take_cdata(&mut self) -> Option<Value> {
        self.cdata.take()
    }

    /// Move the private payload out of the envelope.
    pub fn take_pdata(&mut self) -> Option<Value> {
        self.pdata.take()
    }

    /// Move the list payload out of the envelope.
    pub fn take_clist(&mut self) -> Option<Vec<Value>> {
        self.clist.take()
    }

    /// Move the routing/trust context out of the envelope.
    pub fn take_rinfo(&mut self) -> Option<Value> {
        self.rinfo.take()
    }

    /// Move the file side-channel out of the envelope.
    pub fn take_files(&mut self) -> Option<Value> {
        self.files.take()
    }

    /// Move the binary blob out of the envelope.
    pub fn take_blob(&mut self) -> Option<Bytes> {
        self.blob.take()
    }

    /// Move the call error out of the envelope.
    pub fn take_err(&mut self) -> Option<CallError> {
        self.err.take()
    }

    /// Whether the envelope carries any structured payload field.
    pub(crate) fn has_structured_payload(&self) -> bool {
        self.cdata.is_some()
            || self.pdata.is_some()
            || self.clist.is_some()
            || self.rinfo.is_some()
            || self.files.is_some()
            || self.err.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn take_moves_out_once() {
        let mut msg = Message::new().with_cdata(json!({"a": 1}));
        assert_eq!(msg.take_cdata(), Some(json!({"a": 1})));
        assert_eq!(msg.take_cdata(), None);
        assert!(msg.cdata().is_none());
    }

    #[test]
    fn error_envelope_reports_err() {
        let msg = Message::from_error(err_code::GENERAL, "boom");
        assert!(msg.is_err());
        let err = msg.err().unwrap();
        assert_eq!(err.code, err_code::GENERAL);
        assert_eq!(err.text, "boom");
        assert_eq!(err.to_string(), "[1] boom");
    }

    #[test]
    fn blob_and_structured_fields_are_distinguished() {
        let blob_only = Message::new().with_blob(&b"\x00\x01"[..]);
        assert!(!blob_only.has_structured_payload());
        assert!(blob_only.blob().is_some());

        let mixed = Message::new()
            .with_blob(&b"\x00"[..])
            .with_cdata(json!({}));
        assert!(mixed.has_structured_payload());
    }
}

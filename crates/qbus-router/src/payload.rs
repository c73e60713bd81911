//! Wire payload assembly.
//!
//! The envelope's structured fields travel as one JSON object under fixed
//! single-letter keys; a failed call adds `err_code`/`err_text`. A binary
//! blob travels alone as a file payload; the frame format holds one or
//! the other. The optional base64 filter wraps the JSON text for
//! transports that must stay binary-safe.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{Result, RouterError};
use crate::message::Message;
use qbus_frame::PayloadKind;

const KEY_CDATA: &str = "D";
const KEY_PDATA: &str = "P";
const KEY_CLIST: &str = "L";
const KEY_RINFO: &str = "I";
const KEY_FILES: &str = "F";
const KEY_ERR_CODE: &str = "err_code";
const KEY_ERR_TEXT: &str = "err_text";

/// Byte-stream filter applied to serialized JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFilter {
    /// Raw JSON text. The frame format is length-prefixed, so this is
    /// binary-safe on its own.
    #[default]
    Plain,
    /// Base64-wrapped JSON text, for peers that re-frame payloads through
    /// text-only channels.
    Base64,
}

/// Serialize an envelope's payload fields for the wire.
///
/// Consumes the envelope's sub-objects (single-owner discipline). Returns
/// the payload kind and bytes to put on the frame.
pub fn to_wire(msg: &mut Message, filter: PayloadFilter) -> Result<(PayloadKind, Bytes)> {
    if let Some(blob) = msg.take_blob() {
        if msg.has_structured_payload() {
            return Err(RouterError::MixedPayload);
        }
        return Ok((PayloadKind::File, blob));
    }

    if !msg.has_structured_payload() {
        return Ok((PayloadKind::None, Bytes::new()));
    }

    let mut object = Map::new();
    if let Some(value) = msg.take_cdata() {
        object.insert(KEY_CDATA.to_string(), value);
    }
    if let Some(value) = msg.take_pdata() {
        object.insert(KEY_PDATA.to_string(), value);
    }
    if let Some(values) = msg.take_clist() {
        object.insert(KEY_CLIST.to_string(), Value::Array(values));
    }
    if let Some(value) = msg.take_rinfo() {
        object.insert(KEY_RINFO.to_string(), value);
    }
    if let Some(value) = msg.take_files() {
        object.insert(KEY_FILES.to_string(), value);
    }
    if let Some(err) = msg.take_err() {
        object.insert(KEY_ERR_CODE.to_string(), Value::from(err.code));
        object.insert(KEY_ERR_TEXT.to_string(), Value::from(err.text));
    }

    let text = serde_json::to_vec(&Value::Object(object))?;
    let bytes = match filter {
        PayloadFilter::Plain => Bytes::from(text),
        PayloadFilter::Base64 => Bytes::from(BASE64.encode(text).into_bytes()),
    };
    Ok((PayloadKind::Json, bytes))
}

/// Rebuild an envelope's payload fields from wire bytes.
///
/// `chain_key` and `sender` are frame fields and are filled by the
/// caller, not here.
pub fn from_wire(kind: PayloadKind, payload: &[u8], filter: PayloadFilter) -> Result<Message> {
    let mut msg = Message::new();
    match kind {
        PayloadKind::None => Ok(msg),
        PayloadKind::File => {
            msg.set_blob(payload.to_vec());
            Ok(msg)
        }
        PayloadKind::Json => {
            let decoded;
            let text: &[u8] = match filter {
                PayloadFilter::Plain => payload,
                PayloadFilter::Base64 => {
                    decoded = BASE64.decode(payload)?;
                    &decoded
                }
            };
            let value: Value = serde_json::from_slice(text)?;
            let Value::Object(mut object) = value else {
                // Tolerate bare values by treating them as public payload.
                msg.set_cdata(value);
                return Ok(msg);
            };

            if let Some(value) = object.remove(KEY_CDATA) {
                msg.set_cdata(value);
            }
            if let Some(value) = object.remove(KEY_PDATA) {
                msg.set_pdata(value);
            }
            if let Some(Value::Array(values)) = object.remove(KEY_CLIST) {
                msg.set_clist(values);
            }
            if let Some(value) = object.remove(KEY_RINFO) {
                msg.set_rinfo(value);
            }
            if let Some(value) = object.remove(KEY_FILES) {
                msg.set_files(value);
            }
            let code = object.remove(KEY_ERR_CODE).and_then(|v| v.as_i64());
            let text = object
                .remove(KEY_ERR_TEXT)
                .and_then(|v| v.as_str().map(str::to_string));
            if let Some(code) = code {
                msg.set_error(code, text.unwrap_or_default());
            }
            Ok(msg)
        }
    }
}

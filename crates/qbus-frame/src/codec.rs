use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{FrameError, Result};
use crate::frame::{Frame, FrameKind, PayloadKind};

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Section separator, opens the frame and each header section.
const SEP_SECTION: u8 = b'#';
/// Terminates the frame-kind digits.
const SEP_KIND: u8 = b'!';
/// Separates fields inside a section.
const SEP_FIELD: u8 = b'|';

/// Encode a frame into the wire format.
///
/// Wire format, with literal separators:
///
/// ```text
/// #<kind>!<chain_key>#<module>|<method>|<sender>#<payload_kind>|<payload_len>|<payload>
/// ```
///
/// All eight separators are always emitted; routing fields may be empty;
/// the payload is omitted when its length is zero. Routing fields that
/// contain a separator character are rejected, since the format has no
/// escape mechanism.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    check_field("chain_key", &frame.chain_key)?;
    check_field("module", &frame.module)?;
    check_field("method", &frame.method)?;
    check_field("sender", &frame.sender)?;

    dst.reserve(32 + frame.chain_key.len() + frame.module.len() + frame.method.len()
        + frame.sender.len() + frame.payload.len());

    dst.put_u8(SEP_SECTION);
    dst.put_slice(frame.kind.wire().to_string().as_bytes());
    dst.put_u8(SEP_KIND);
    dst.put_slice(frame.chain_key.as_bytes());
    dst.put_u8(SEP_SECTION);
    dst.put_slice(frame.module.as_bytes());
    dst.put_u8(SEP_FIELD);
    dst.put_slice(frame.method.as_bytes());
    dst.put_u8(SEP_FIELD);
    dst.put_slice(frame.sender.as_bytes());
    dst.put_u8(SEP_SECTION);
    dst.put_slice(frame.payload_kind.wire().to_string().as_bytes());
    dst.put_u8(SEP_FIELD);
    dst.put_slice(frame.payload.len().to_string().as_bytes());
    dst.put_u8(SEP_FIELD);
    if !frame.payload.is_empty() {
        dst.put_slice(&frame.payload);
    }
    Ok(())
}

fn check_field(field: &'static str, value: &str) -> Result<()> {
    if value
        .bytes()
        .any(|b| b == SEP_SECTION || b == SEP_KIND || b == SEP_FIELD)
    {
        return Err(FrameError::SeparatorInField { field });
    }
    Ok(())
}

/// Outcome of one [`FrameDecoder::feed`] call.
#[derive(Debug)]
pub struct FeedResult {
    /// How many input bytes were consumed.
    pub consumed: usize,
    /// The completed frame, if one finished within the consumed bytes.
    pub frame: Option<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Kind,
    ChainKey,
    Module,
    Method,
    Sender,
    PayloadKind,
    PayloadLen,
    Payload,
}

/// Resumable wire-format decoder.
///
/// Feed it bytes in chunks of any size; it returns at most one frame per
/// call together with the number of bytes consumed. When a frame completes
/// before the chunk is exhausted, callers loop and feed the remainder:
/// several frames may be packed back-to-back in one socket read. Partial
/// accumulation persists across calls.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    acc: Vec<u8>,
    kind: FrameKind,
    chain_key: String,
    module: String,
    method: String,
    sender: String,
    payload_kind: PayloadKind,
    payload_len: usize,
    payload: BytesMut,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default payload cap.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder with an explicit payload cap.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            state: DecodeState::Start,
            acc: Vec::new(),
            kind: FrameKind::None,
            chain_key: String::new(),
            module: String::new(),
            method: String::new(),
            sender: String::new(),
            payload_kind: PayloadKind::None,
            payload_len: 0,
            payload: BytesMut::new(),
            max_payload,
        }
    }

    /// Whether the decoder sits between frames (nothing accumulated).
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Start
    }

    /// Consume input bytes, returning the consumed count and at most one
    /// completed frame.
    pub fn feed(&mut self, input: &[u8]) -> Result<FeedResult> {
        let mut pos = 0usize;

        while pos < input.len() {
            match self.state {
                DecodeState::Start => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_SECTION {
                        self.state = DecodeState::Kind;
                    } else {
                        // Protocol violation: keep scanning in place rather
                        // than dropping the connection. Known weakness.
                        warn!(byte, "expected frame start separator, skipping byte");
                    }
                }
                DecodeState::Kind => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_KIND {
                        let value = self.take_int("kind")?;
                        self.kind = FrameKind::from_wire(value)?;
                        self.state = DecodeState::ChainKey;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::ChainKey => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_SECTION {
                        self.chain_key = self.take_string();
                        self.state = DecodeState::Module;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::Module => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_FIELD {
                        self.module = self.take_string();
                        self.state = DecodeState::Method;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::Method => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_FIELD {
                        self.method = self.take_string();
                        self.state = DecodeState::Sender;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::Sender => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_SECTION {
                        self.sender = self.take_string();
                        self.state = DecodeState::PayloadKind;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::PayloadKind => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_FIELD {
                        let value = self.take_int("payload_kind")?;
                        self.payload_kind = PayloadKind::from_wire(value)?;
                        self.state = DecodeState::PayloadLen;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::PayloadLen => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == SEP_FIELD {
                        let value = self.take_int("payload_len")? as usize;
                        if value > self.max_payload {
                            return Err(FrameError::PayloadTooLarge {
                                size: value,
                                max: self.max_payload,
                            });
                        }
                        if value == 0 {
                            // Zero-length payload completes right here;
                            // the payload state is never entered.
                            let frame = self.complete(Bytes::new());
                            return Ok(FeedResult {
                                consumed: pos,
                                frame: Some(frame),
                            });
                        }
                        self.payload_len = value;
                        self.payload = BytesMut::with_capacity(value);
                        self.state = DecodeState::Payload;
                    } else {
                        self.acc.push(byte);
                    }
                }
                DecodeState::Payload => {
                    let want = self.payload_len - self.payload.len();
                    let take = want.min(input.len() - pos);
                    self.payload.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    if self.payload.len() == self.payload_len {
                        let payload = self.payload.split().freeze();
                        let frame = self.complete(payload);
                        return Ok(FeedResult {
                            consumed: pos,
                            frame: Some(frame),
                        });
                    }
                }
            }
        }

        Ok(FeedResult {
            consumed: pos,
            frame: None,
        })
    }

    fn take_string(&mut self) -> String {
        let raw = std::mem::take(&mut self.acc);
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn take_int(&mut self, field: &'static str) -> Result<u64> {
        let raw = std::mem::take(&mut self.acc);
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or(FrameError::BadInteger { field })
    }

    fn complete(&mut self, payload: Bytes) -> Frame {
        let frame = Frame {
            kind: self.kind,
            chain_key: std::mem::take(&mut self.chain_key),
            module: std::mem::take(&mut self.module),
            method: std::mem::take(&mut self.method),
            sender: std::mem::take(&mut self.sender),
            payload_kind: self.payload_kind,
            payload,
        };
        self.kind = FrameKind::None;
        self.payload_kind = PayloadKind::None;
        self.payload_len = 0;
        self.state = DecodeState::Start;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::new(FrameKind::MsgReq, "abc-123")
            .with_target("AUTH", "getVaultSecret")
            .with_sender("JOBS")
            .with_json(&b"{}"[..])
    }

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_exact_wire_bytes() {
        let wire = encode(&sample_frame());
        assert_eq!(wire.as_ref(), b"#3!abc-123#AUTH|getVaultSecret|JOBS#1|2|{}");
    }

    #[test]
    fn decode_reproduces_fields() {
        let frame = sample_frame();
        let wire = encode(&frame);

        let mut decoder = FrameDecoder::new();
        let result = decoder.feed(&wire).unwrap();
        assert_eq!(result.consumed, wire.len());
        assert_eq!(result.frame.unwrap(), frame);
    }

    #[test]
    fn decode_one_byte_at_a_time() {
        let frame = sample_frame();
        let wire = encode(&frame);

        let mut decoder = FrameDecoder::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            let result = decoder.feed(std::slice::from_ref(byte)).unwrap();
            assert_eq!(result.consumed, 1);
            if let Some(frame) = result.frame {
                assert_eq!(i, wire.len() - 1, "frame must complete on the last byte");
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded.unwrap(), frame);
    }

    #[test]
    fn decode_every_two_way_split() {
        let frame = sample_frame();
        let wire = encode(&frame);

        for split in 0..=wire.len() {
            let mut decoder = FrameDecoder::new();
            let first = decoder.feed(&wire[..split]).unwrap();
            assert!(first.frame.is_none() || split == wire.len());
            let start = first.consumed;
            assert_eq!(start, split);

            let mut decoded = first.frame;
            let mut rest = &wire[split..];
            while !rest.is_empty() {
                let result = decoder.feed(rest).unwrap();
                rest = &rest[result.consumed..];
                if let Some(frame) = result.frame {
                    decoded = Some(frame);
                }
            }
            assert_eq!(decoded.unwrap(), frame, "split at {split}");
        }
    }

    #[test]
    fn zero_length_payload_completes_at_length_boundary() {
        let frame = Frame::new(FrameKind::RouteReq, "rk-1").with_sender("AUTH");
        let wire = encode(&frame);
        assert!(wire.ends_with(b"#0|0|"));

        let mut decoder = FrameDecoder::new();
        let result = decoder.feed(&wire).unwrap();
        assert_eq!(result.consumed, wire.len());

        let decoded = result.frame.unwrap();
        assert_eq!(decoded.payload_kind, PayloadKind::None);
        assert!(decoded.payload.is_empty());
        assert!(decoder.is_idle());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let frames = vec![
            sample_frame(),
            Frame::new(FrameKind::MsgRes, "abc-123")
                .with_sender("AUTH")
                .with_json(&br#"{"ok":true}"#[..]),
            Frame::new(FrameKind::RouteReq, "rk-9").with_sender("JOBS"),
        ];

        let mut wire = BytesMut::new();
        for frame in &frames {
            encode_frame(frame, &mut wire).unwrap();
        }

        let mut decoder = FrameDecoder::new();
        let mut rest = wire.as_ref();
        let mut decoded = Vec::new();
        while !rest.is_empty() {
            let result = decoder.feed(rest).unwrap();
            assert!(result.consumed > 0);
            rest = &rest[result.consumed..];
            if let Some(frame) = result.frame {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn consumed_count_positions_next_frame() {
        let first = sample_frame();
        let second = Frame::new(FrameKind::Methods, "mk-1").with_target("AUTH", "");
        let mut wire = BytesMut::new();
        encode_frame(&first, &mut wire).unwrap();
        let first_len = wire.len();
        encode_frame(&second, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let result = decoder.feed(&wire).unwrap();
        assert_eq!(result.consumed, first_len);
        assert_eq!(result.frame.unwrap(), first);

        let result = decoder.feed(&wire[first_len..]).unwrap();
        assert_eq!(result.consumed, wire.len() - first_len);
        assert_eq!(result.frame.unwrap(), second);
    }

    #[test]
    fn empty_routing_fields_roundtrip() {
        let frame = Frame::new(FrameKind::MsgRes, "");
        let wire = encode(&frame);
        assert_eq!(wire.as_ref(), b"#4!#||#0|0|");

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire).unwrap().frame.unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn payload_bytes_are_not_scanned_for_separators() {
        let payload = br#"{"text":"a#b!c|d"}"#;
        let frame = Frame::new(FrameKind::MsgReq, "ck")
            .with_target("LOG", "write")
            .with_json(&payload[..]);
        let wire = encode(&frame);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire).unwrap().frame.unwrap();
        assert_eq!(decoded.payload.as_ref(), payload);
    }

    #[test]
    fn garbage_before_start_is_skipped() {
        let frame = sample_frame();
        let mut wire = BytesMut::from(&b"xx"[..]);
        encode_frame(&frame, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let result = decoder.feed(&wire).unwrap();
        assert_eq!(result.consumed, wire.len());
        assert_eq!(result.frame.unwrap(), frame);
    }

    #[test]
    fn separator_in_routing_field_rejected() {
        let mut buf = BytesMut::new();
        for bad in ["a#b", "a!b", "a|b"] {
            let frame = Frame::new(FrameKind::MsgReq, "ck").with_target(bad, "m");
            let err = encode_frame(&frame, &mut buf).unwrap_err();
            assert!(matches!(
                err,
                FrameError::SeparatorInField { field: "module" }
            ));
        }
    }

    #[test]
    fn unknown_kind_on_wire_rejected() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(b"#9!ck#m|f|s#0|0|").unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(9)));
    }

    #[test]
    fn non_numeric_kind_rejected() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(b"#x!ck#m|f|s#0|0|").unwrap_err();
        assert!(matches!(err, FrameError::BadInteger { field: "kind" }));
    }

    #[test]
    fn oversized_payload_rejected_before_accumulation() {
        let mut decoder = FrameDecoder::with_max_payload(8);
        let err = decoder.feed(b"#3!ck#m|f|s#1|9|123456789").unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size: 9, max: 8 }
        ));
    }

    #[test]
    fn binary_payload_roundtrip() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let frame = Frame::new(FrameKind::MsgReq, "bin")
            .with_target("FS", "put")
            .with_payload(PayloadKind::File, payload.clone());
        let wire = encode(&frame);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire).unwrap().frame.unwrap();
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        assert_eq!(decoded.payload_kind, PayloadKind::File);
    }
}

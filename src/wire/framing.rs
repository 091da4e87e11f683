//! Incremental MessagePack framing for RPC channels.
//!
//! MessagePack values are self-delimiting, so a channel carries frames
//! back-to-back with no length prefix. The decoder buffers raw bytes from
//! successive reads and yields every complete message as soon as it is
//! available, keeping a trailing partial frame for the next read.
//!
//! # Wire Format
//!
//! ```text
//! <msgpack array><msgpack array><partial msgpa...
//! ```
//!
//! Frame boundaries are found by walking value headers only, and the walk
//! resumes where the previous read left off. Each buffered byte is looked
//! at once; a frame is handed to `rmpv` for decoding only after all of it
//! has arrived.

use std::io;

use rmpv::Value;
use thiserror::Error;

use super::message::Message;

/// Default cap on buffered bytes for a single frame (100MB), to stop a
/// buggy or hostile peer from growing the buffer without bound.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Framing-level errors. Any of these leaves the stream out of sync, so
/// the channel carrying it is torn down.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Bytes that are not valid MessagePack.
    #[error("Malformed frame: {0}")]
    Decode(#[source] rmpv::decode::Error),

    /// Valid MessagePack that is not a msgpack-rpc envelope.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A frame is, or announces itself as, larger than the configured maximum.
    #[error("Frame size {size} exceeds maximum {max} bytes")]
    TooLarge { size: u64, max: usize },

    /// Encoding an outgoing message failed.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] io::Error),
}

/// Progress through the frame at the front of the buffer.
#[derive(Debug, Clone, Copy)]
struct Scan {
    /// Offset of the next value header, relative to the frame start. Runs
    /// past the end of the buffer while a string or binary body is still
    /// arriving.
    offset: u64,
    /// Values still missing before the frame is complete.
    pending: u64,
}

/// Resumable decoder that turns a byte stream into [`Message`]s.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scan: Option<Scan>,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan: None,
            max_frame_bytes,
        }
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `bytes` and return every message that is now complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered bytes are not MessagePack, decode to
    /// something other than an envelope, or a frame is larger than the
    /// maximum. The decoder must not be fed again after an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FrameError> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut start = 0usize;

        while let Some(len) = scan_frame(&mut self.scan, &self.buf[start..], self.max_frame_bytes)? {
            let mut frame = &self.buf[start..start + len];
            let value = rmpv::decode::read_value(&mut frame).map_err(FrameError::Decode)?;
            messages.push(Message::from_value(value)?);
            start += len;
        }

        self.buf.drain(..start);
        Ok(messages)
    }
}

/// Length of the frame at the front of `bytes`, or `None` while some of it
/// has yet to arrive.
fn scan_frame(
    state: &mut Option<Scan>,
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<Option<usize>, FrameError> {
    if bytes.is_empty() && state.is_none() {
        return Ok(None);
    }
    let mut scan = state.unwrap_or(Scan {
        offset: 0,
        pending: 1,
    });

    while scan.pending > 0 {
        let header = usize::try_from(scan.offset)
            .ok()
            .and_then(|offset| bytes.get(offset..))
            .and_then(value_extent);
        let Some((size, children)) = header else {
            *state = Some(scan);
            return Ok(None);
        };
        scan.offset += size;
        scan.pending = scan.pending - 1 + children;

        if scan.offset > max_frame_bytes as u64 {
            return Err(FrameError::TooLarge {
                size: scan.offset,
                max: max_frame_bytes,
            });
        }
    }

    // `offset` is within the cap, so it fits in a usize.
    let len = scan.offset as usize;
    if len > bytes.len() {
        *state = Some(scan);
        return Ok(None);
    }
    *state = None;
    Ok(Some(len))
}

/// Size of the value starting at `bytes[0]`, not counting nested values,
/// and how many nested values follow it. `None` until the whole header is
/// available.
fn value_extent(bytes: &[u8]) -> Option<(u64, u64)> {
    let marker = *bytes.first()?;
    let field = |width: usize| -> Option<u64> {
        let raw = bytes.get(1..1 + width)?;
        Some(raw.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    };

    let extent = match marker {
        // fixint, nil, bool (and the reserved 0xc1, which rmpv reads as nil)
        0x00..=0x7f | 0xc0..=0xc3 | 0xe0..=0xff => (1, 0),
        0x80..=0x8f => (1, 2 * u64::from(marker & 0x0f)),
        0x90..=0x9f => (1, u64::from(marker & 0x0f)),
        0xa0..=0xbf => (1 + u64::from(marker & 0x1f), 0),
        // bin 8/16/32
        0xc4 => (2 + field(1)?, 0),
        0xc5 => (3 + field(2)?, 0),
        0xc6 => (5 + field(4)?, 0),
        // ext 8/16/32: length, then a type byte
        0xc7 => (3 + field(1)?, 0),
        0xc8 => (4 + field(2)?, 0),
        0xc9 => (6 + field(4)?, 0),
        0xca => (5, 0),
        0xcb => (9, 0),
        0xcc | 0xd0 => (2, 0),
        0xcd | 0xd1 => (3, 0),
        0xce | 0xd2 => (5, 0),
        0xcf | 0xd3 => (9, 0),
        // fixext 1/2/4/8/16
        0xd4 => (3, 0),
        0xd5 => (4, 0),
        0xd6 => (6, 0),
        0xd7 => (10, 0),
        0xd8 => (18, 0),
        // str 8/16/32
        0xd9 => (2 + field(1)?, 0),
        0xda => (3 + field(2)?, 0),
        0xdb => (5 + field(4)?, 0),
        0xdc => (3, field(2)?),
        0xdd => (5, field(4)?),
        0xde => (3, 2 * field(2)?),
        0xdf => (5, 2 * field(4)?),
    };
    Some(extent)
}

/// Encode a message into a single frame.
pub fn encode_message(message: Message) -> Result<Vec<u8>, FrameError> {
    encode_value(&message.into_value())
}

/// Encode an arbitrary value (used for pre-built envelopes in tests and tools).
pub fn encode_value(value: &Value) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, value)
        .map_err(|e| FrameError::Encode(io::Error::other(e.to_string())))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{make_ext_handle, RpcError};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    fn request_bytes(id: u64, method: &str, args: Vec<Value>) -> Vec<u8> {
        encode_message(Message::request(id, method, args)).expect("encode failed")
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::default();
        let bytes = request_bytes(1, "nvim_get_api_info", vec![]);

        let messages = decoder.feed(&bytes).expect("decode failed");

        assert_eq!(
            messages,
            vec![Message::request(1, "nvim_get_api_info", vec![])]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut decoder = FrameDecoder::default();
        let bytes = request_bytes(42, "echo", vec![Value::from("a fairly long argument")]);

        // Feed one byte at a time, the way a pipe may surface it.
        let mut decoded = Vec::new();
        for byte in &bytes {
            decoded.extend(decoder.feed(std::slice::from_ref(byte)).expect("decode failed"));
        }

        assert_eq!(
            decoded,
            vec![Message::request(
                42,
                "echo",
                vec![Value::from("a fairly long argument")]
            )]
        );
    }

    #[test]
    fn test_multiple_frames_with_trailing_partial() {
        let mut decoder = FrameDecoder::default();
        let first = request_bytes(1, "a", vec![]);
        let second = encode_message(Message::notification("b", vec![Value::from(2)])).unwrap();
        let third = request_bytes(3, "c", vec![]);

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&first);
        chunk.extend_from_slice(&second);
        chunk.extend_from_slice(&third[..2]);

        let messages = decoder.feed(&chunk).expect("decode failed");
        assert_eq!(messages.len(), 2);
        assert_eq!(decoder.buffered(), 2);

        let messages = decoder.feed(&third[2..]).expect("decode failed");
        assert_eq!(messages, vec![Message::request(3, "c", vec![])]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        let mut decoder = FrameDecoder::default();
        // 0xc1 is the one marker MessagePack never uses.
        let result = decoder.feed(&[0xc1]);
        assert!(result.is_err(), "Expected decode error, got {:?}", result);
    }

    #[test]
    fn test_non_envelope_value_rejected() {
        let mut decoder = FrameDecoder::default();
        let bytes = encode_value(&Value::from("hello")).unwrap();
        let err = decoder.feed(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessage(_)));
    }

    #[test]
    fn test_rejects_oversized_partial_frame() {
        let mut decoder = FrameDecoder::new(16);
        let bytes = request_bytes(1, "echo", vec![Value::from("x".repeat(64))]);
        let err = decoder.feed(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(
            err.to_string().contains("exceeds maximum"),
            "Expected size error, got: {}",
            err
        );
    }

    fn arb_scalar() -> impl Strategy<Value = Value> + Clone {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            // NaN never equals itself.
            (-1.0e9f64..1.0e9f64).prop_map(Value::F64),
            "[a-z]{0,12}".prop_map(Value::from),
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::Binary),
            (0i8..3, any::<i64>()).prop_map(|(ty, n)| make_ext_handle(ty, n)),
            (any::<i8>(), proptest::collection::vec(any::<u8>(), 0..20))
                .prop_map(|(ty, data)| Value::Ext(ty, data)),
        ]
    }

    fn arb_value() -> impl Strategy<Value = Value> + Clone {
        arb_scalar().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,6}".prop_map(Value::from), inner), 0..4)
                    .prop_map(Value::Map),
            ]
        })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let args = proptest::collection::vec(arb_value(), 0..4);
        prop_oneof![
            (any::<u32>(), "[a-z_]{1,16}", args.clone())
                .prop_map(|(id, m, a)| Message::request(id as u64, m, a)),
            ("[a-z_]{1,16}", args).prop_map(|(m, a)| Message::notification(m, a)),
            (any::<u32>(), arb_value()).prop_map(|(id, v)| Message::response(id as u64, Ok(v))),
            (any::<u32>(), any::<i64>(), "[ -~]{0,20}").prop_map(|(id, code, text)| {
                Message::response(id as u64, Err(RpcError::new(code, text)))
            }),
        ]
    }

    #[test]
    fn test_oversized_header_rejected_before_body() {
        let mut decoder = FrameDecoder::new(1024);
        // str32 announcing 1MB; only the header has arrived.
        let header = [0x94, 0x00, 0x01, 0xdb, 0x00, 0x10, 0x00, 0x00];
        let err = decoder.feed(&header).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 1024, .. }), "got {:?}", err);
    }

    #[test]
    fn test_large_frame_in_small_reads_is_linear() {
        let blob = vec![0x5a_u8; 8 * 1024 * 1024];
        let many: Vec<Value> = (0..100_000).map(Value::from).collect();
        let message = Message::request(
            1,
            "nvim_buf_set_lines",
            vec![Value::Binary(blob), Value::Array(many)],
        );
        let bytes = encode_message(message.clone()).unwrap();

        let mut decoder = FrameDecoder::default();
        let started = Instant::now();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(4096) {
            decoded.extend(decoder.feed(chunk).expect("decode failed"));
        }
        let elapsed = started.elapsed();

        assert_eq!(decoded.len(), 1);
        assert!(decoded[0] == message, "large frame decoded differently");
        assert_eq!(decoder.buffered(), 0);
        assert!(
            elapsed < Duration::from_secs(3),
            "decoding {} bytes in 4096-byte reads took {:?}",
            bytes.len(),
            elapsed
        );
    }

    #[test]
    fn test_nested_values_split_at_every_byte() {
        let args = vec![
            Value::Map(vec![(
                Value::from("lines"),
                Value::Array(vec![Value::from("a"), Value::from(1.5f64)]),
            )]),
            make_ext_handle(1, 1000),
            Value::Ext(5, vec![0; 300]),
            Value::from(u64::MAX),
        ];
        let first = request_bytes(1, "nvim_call_function", args.clone());
        let second = request_bytes(2, "echo", vec![]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        for split in 1..stream.len() {
            let mut decoder = FrameDecoder::default();
            let mut decoded = decoder.feed(&stream[..split]).unwrap();
            decoded.extend(decoder.feed(&stream[split..]).unwrap());
            assert_eq!(
                decoded,
                vec![
                    Message::request(1, "nvim_call_function", args.clone()),
                    Message::request(2, "echo", vec![]),
                ],
                "split at {}",
                split
            );
        }
    }

    proptest! {
        #[test]
        fn prop_encoded_messages_decode_to_themselves(messages in proptest::collection::vec(arb_message(), 1..6)) {
            let mut stream = Vec::new();
            for msg in &messages {
                stream.extend(encode_message(msg.clone()).unwrap());
            }
            let mut decoder = FrameDecoder::default();
            let decoded = decoder.feed(&stream).unwrap();
            prop_assert_eq!(decoded, messages);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}

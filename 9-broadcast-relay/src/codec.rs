//! MessagePack framing for chat messages.
//!
//! A frame is a two-element MessagePack array `[sender, body]`. MessagePack is
//! self-delimiting, so frames are written back to back with no extra header and
//! the decoder finds frame boundaries from the array and string headers.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chat message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Message {
    pub sender: String,
    pub body: String,
}

impl Message {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode(&self.sender, &self.body)
    }
}

impl From<(String, String)> for Message {
    fn from((sender, body): (String, String)) -> Self {
        Self { sender, body }
    }
}

impl From<Message> for (String, String) {
    fn from(message: Message) -> Self {
        (message.sender, message.body)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] rmp_serde::decode::Error),
    #[error("pending frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Serializes `[sender, body]` into a single frame.
pub fn encode(sender: &str, body: &str) -> Bytes {
    // Serializing two strings into a Vec has no failure path.
    let encoded = rmp_serde::to_vec(&(sender, body)).expect("in-memory msgpack encoding");
    Bytes::from(encoded)
}

/// Incremental decoder holding whatever bytes have not yet formed a frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    limit: Option<usize>,
    /// Length of the frame at the head of `buffer`, once known.
    pending: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that fails once a partial frame grows past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Appends `incoming` and drains every complete frame now in the buffer.
    ///
    /// A trailing partial frame stays buffered for the next call. After an
    /// error the decoder should be discarded; it does not try to resync.
    pub fn decode_stream(&mut self, incoming: &[u8]) -> Result<Vec<Message>, DecodeError> {
        self.buffer.extend_from_slice(incoming);

        let mut messages = Vec::new();
        while let Some(len) = self.frame_len()? {
            if self.buffer.len() < len {
                break;
            }
            self.pending = None;
            let frame = self.buffer.split_to(len);
            let message = rmp_serde::from_slice(&frame).map_err(DecodeError::Malformed)?;
            messages.push(message);
        }

        if let Some(limit) = self.limit {
            if self.buffer.len() > limit {
                return Err(DecodeError::FrameTooLarge { limit });
            }
        }

        Ok(messages)
    }

    /// Bytes received but not yet resolved into a message.
    pub fn remaining(&self) -> &[u8] {
        &self.buffer
    }

    /// Length of the frame at the head of the buffer, once its headers are in.
    ///
    /// The body of a partial frame is never parsed, so a large frame arriving
    /// in many reads costs one pass over its bytes.
    fn frame_len(&mut self) -> Result<Option<usize>, DecodeError> {
        if let Some(len) = self.pending {
            return Ok(Some(len));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match measure(&self.buffer) {
            Ok(Some(len)) => {
                self.pending = Some(len);
                Ok(Some(len))
            }
            Ok(None) => Ok(None),
            Err(err) if needs_more_input(&err) => Ok(None),
            Err(err) => Err(DecodeError::Malformed(err)),
        }
    }
}

/// Walks the array and string headers of one frame without touching the
/// string payloads. `None` means the sender is still arriving, so the body
/// header can't be read yet.
fn measure(buffer: &[u8]) -> Result<Option<usize>, rmp_serde::decode::Error> {
    use rmp_serde::decode::Error;

    let mut rest = buffer;
    let fields = rmp::decode::read_array_len(&mut rest)?;
    if fields != 2 {
        return Err(Error::LengthMismatch(fields));
    }

    let sender_len = rmp::decode::read_str_len(&mut rest)? as usize;
    if rest.len() < sender_len {
        return Ok(None);
    }
    rest = &rest[sender_len..];

    let body_len = rmp::decode::read_str_len(&mut rest)? as usize;
    Ok(Some(buffer.len() - rest.len() + body_len))
}

fn needs_more_input(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;

    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote() -> Message {
        Message::new("albert", "The only source of knowledge is experience.")
    }

    #[test]
    fn single_frame_roundtrip() {
        let mut decoder = FrameDecoder::new();
        let messages = decoder
            .decode_stream(&quote().encode())
            .expect("decode frame");

        assert_eq!(messages, vec![quote()]);
        assert!(decoder.remaining().is_empty());
    }

    #[test]
    fn frame_is_a_two_element_msgpack_array() {
        let frame = encode("a", "bc");
        assert_eq!(&frame[..], &[0x92, 0xa1, b'a', 0xa2, b'b', b'c']);
    }

    #[test]
    fn empty_strings_roundtrip() {
        let mut decoder = FrameDecoder::new();
        let messages = decoder.decode_stream(&encode("", "")).expect("decode");
        assert_eq!(messages, vec![Message::new("", "")]);
    }

    #[test]
    fn unicode_and_long_bodies_roundtrip() {
        let body = "żółć ✓ ".repeat(5_000);
        let message = Message::new("zop", body);
        let mut decoder = FrameDecoder::new();
        let messages = decoder.decode_stream(&message.encode()).expect("decode");
        assert_eq!(messages, vec![message]);
    }

    #[test]
    fn split_at_every_boundary_yields_one_message() {
        let frame = quote().encode();

        for split in 1..frame.len() {
            let mut decoder = FrameDecoder::new();
            let first = decoder.decode_stream(&frame[..split]).expect("head");
            assert!(first.is_empty(), "split at {split} produced early output");
            assert_eq!(decoder.remaining(), &frame[..split]);

            let second = decoder.decode_stream(&frame[split..]).expect("tail");
            assert_eq!(second, vec![quote()], "split at {split}");
            assert!(decoder.remaining().is_empty());
        }
    }

    #[test]
    fn byte_by_byte_trickle_only_emits_on_last_byte() {
        let frame = quote().encode();
        let mut decoder = FrameDecoder::new();

        for (index, byte) in frame.iter().enumerate() {
            let messages = decoder.decode_stream(&[*byte]).expect("trickle");
            if index + 1 == frame.len() {
                assert_eq!(messages, vec![quote()]);
            } else {
                assert!(messages.is_empty());
            }
        }
    }

    #[test]
    fn burst_of_frames_decodes_in_order() {
        let first = Message::new("ZoP", "Beautiful is better than ugly.");
        let second = Message::new("ZoP", "Explicit is better than implicit.");
        let mut burst = first.encode().to_vec();
        burst.extend_from_slice(&second.encode());

        let mut decoder = FrameDecoder::new();
        let messages = decoder.decode_stream(&burst).expect("burst");
        assert_eq!(messages, vec![first, second]);
    }

    #[test]
    fn tail_of_one_frame_with_head_of_next() {
        let first = Message::new("hst", "Some may never live,");
        let second = Message::new("hst", "but the crazy never die.");
        let mut stream = first.encode().to_vec();
        stream.extend_from_slice(&second.encode());

        let cut_one = 4;
        let cut_two = first.encode().len() + 3;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode_stream(&stream[..cut_one]).expect("a").is_empty());
        assert_eq!(
            decoder.decode_stream(&stream[cut_one..cut_two]).expect("b"),
            vec![first]
        );
        assert_eq!(decoder.remaining().len(), 3);
        assert_eq!(
            decoder.decode_stream(&stream[cut_two..]).expect("c"),
            vec![second]
        );
    }

    #[test]
    fn empty_chunk_is_a_no_op() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode_stream(&[]).expect("empty").is_empty());
        assert!(decoder.remaining().is_empty());
    }

    #[test]
    fn non_array_frame_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let garbage = rmp_serde::to_vec(&42u32).expect("encode int");
        let result = decoder.decode_stream(&garbage);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn array_of_three_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let frame = rmp_serde::to_vec(&("a", "b", "c")).expect("encode triple");
        let result = decoder.decode_stream(&frame);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn large_frame_in_small_reads_is_not_reparsed() {
        let message = Message::new("zop", "x".repeat(8 * 1024 * 1024));
        let frame = message.encode();
        let mut decoder = FrameDecoder::new();

        let started = std::time::Instant::now();
        let mut decoded = Vec::new();
        for chunk in frame.chunks(4096) {
            decoded.extend(decoder.decode_stream(chunk).expect("chunk"));
        }

        assert_eq!(decoded, vec![message]);
        assert!(decoder.remaining().is_empty());
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn reserved_marker_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let result = decoder.decode_stream(&[0xc1]);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn garbage_after_valid_frame_fails_the_stream() {
        let mut decoder = FrameDecoder::new();
        let mut stream = quote().encode().to_vec();
        stream.push(0xc1);
        assert!(decoder.decode_stream(&stream).is_err());
    }

    #[test]
    fn oversized_partial_frame_is_rejected() {
        let frame = Message::new("x", "y".repeat(64)).encode();
        let mut decoder = FrameDecoder::with_limit(16);

        let result = decoder.decode_stream(&frame[..32]);
        assert!(matches!(
            result,
            Err(DecodeError::FrameTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn limit_applies_only_to_pending_bytes() {
        let mut decoder = FrameDecoder::with_limit(64);
        let mut burst = Vec::new();
        for i in 0..10 {
            burst.extend_from_slice(&encode("n", &format!("message {i}")));
        }
        assert!(burst.len() > 64);

        let messages = decoder.decode_stream(&burst).expect("burst under limit");
        assert_eq!(messages.len(), 10);
    }
}

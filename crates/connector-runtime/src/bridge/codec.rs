//! Framed codec for the orchestrator stream.
//!
//! Frame layout: `[length: u32 BE][type: u8][body: length-1 bytes]`, where
//! `length` counts the type byte plus the body. `FrameCodec` handles raw
//! frames; `RecordCodec<T>` adds serde_json (de)serialization of one record
//! kind on top. Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{MessageType, Record};

/// Largest accepted value of the length prefix (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Largest record payload that still fits in a frame once base64-encoded,
/// with 64 KiB left for the other record fields.
pub const MAX_PAYLOAD_LEN: usize = (MAX_FRAME_LEN - 64 * 1024) / 4 * 3;

const LENGTH_PREFIX_LEN: usize = 4;

/// Protocol-level failures. All of them are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    ConnectionClosed { buffered: usize },
    #[error("frame has no message type byte")]
    EmptyFrame,
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("expected {expected:?} frame, got {actual:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("malformed record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
    #[error("stream i/o: {0}")]
    Io(#[from] io::Error),
}

/// One undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub message_type: MessageType,
    pub body: Bytes,
}

impl RawFrame {
    pub fn new(message_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }
}

/// Length-prefixed frame codec.
///
/// Wraps LengthDelimitedCodec and adds the message type byte. Partial input is
/// buffered by the caller (`FramedRead`) until a whole frame is available.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .big_endian()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Check the prefix ourselves so oversized frames surface as FrameTooLarge
        // rather than a generic InvalidData error.
        if src.len() >= LENGTH_PREFIX_LEN {
            let len = (&src[..LENGTH_PREFIX_LEN]).get_u32() as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }
            if len == 0 {
                return Err(FrameError::EmptyFrame);
            }
        }

        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        let type_byte = frame.get_u8();
        let message_type =
            MessageType::try_from(type_byte).map_err(FrameError::UnknownMessageType)?;
        Ok(Some(RawFrame {
            message_type,
            body: frame.freeze(),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.body.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let mut framed = BytesMut::with_capacity(len);
        framed.put_u8(item.message_type.as_byte());
        framed.extend_from_slice(&item.body);
        self.inner.encode(framed.freeze(), dst)?;
        Ok(())
    }
}

/// Codec that frames one record kind and serializes it with JSON.
pub struct RecordCodec<T> {
    frames: FrameCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for RecordCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec<T> {
    pub fn new() -> Self {
        Self {
            frames: FrameCodec::new(),
            _phantom: PhantomData,
        }
    }
}

impl<T> RecordCodec<T>
where
    T: Record,
{
    fn parse(frame: RawFrame) -> Result<T, FrameError> {
        if frame.message_type != T::MESSAGE_TYPE {
            return Err(FrameError::UnexpectedMessageType {
                expected: T::MESSAGE_TYPE,
                actual: frame.message_type,
            });
        }
        Ok(serde_json::from_slice(&frame.body)?)
    }
}

impl<T: Record> Decoder for RecordCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode(src)?.map(Self::parse).transpose()
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode_eof(buf)?.map(Self::parse).transpose()
    }
}

impl<T: Record> Encoder<T> for RecordCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.frames
            .encode(RawFrame::new(T::MESSAGE_TYPE, json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ErrorClass, ExecutionRequest, ExecutionResponse};
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn request(id: u64) -> ExecutionRequest {
        ExecutionRequest {
            request_id: id,
            tenant_id: "acme".to_string(),
            workspace_id: Some("ws".to_string()),
            trace_id: None,
            connector_name: "http".to_string(),
            operation: "request".to_string(),
            deadline_at_ms: 42,
            payload: b"ping".to_vec(),
        }
    }

    #[test]
    fn encode_layout_is_length_type_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(RawFrame::new(MessageType::ExecuteResponse, &b"abc"[..]), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], &[0, 0, 0, 4, 0x01, b'a', b'b', b'c']);
    }

    #[test]
    fn raw_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = RawFrame::new(MessageType::ExecuteRequest, vec![9u8; 300]);

        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_body_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = RawFrame::new(MessageType::ExecuteResponse, Bytes::new());

        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn byte_by_byte_feed_reassembles_frame() {
        let mut encoder = FrameCodec::new();
        let mut wire = BytesMut::new();
        let frame = RawFrame::new(MessageType::ExecuteRequest, &b"hello frame"[..]);
        encoder.encode(frame.clone(), &mut wire).unwrap();

        let mut decoder = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut out = None;
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = decoder.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none(), "frame completed early at byte {i}");
            } else {
                out = decoded;
            }
        }
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_u8(0x00);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        insta::assert_snapshot!(err.to_string(), @"frame of 10485761 bytes exceeds limit of 10485760");
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::EmptyFrame)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0x7f][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn eof_mid_frame_is_connection_closed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 0x00, 1, 2][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::ConnectionClosed { buffered: 7 })
        ));
    }

    #[test]
    fn eof_at_boundary_is_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn record_roundtrip_request() {
        let mut codec = RecordCodec::<ExecutionRequest>::new();
        let mut buf = BytesMut::new();

        codec.encode(request(1), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, request(1));
    }

    #[test]
    fn record_roundtrip_response() {
        let mut codec = RecordCodec::<ExecutionResponse>::new();
        let mut buf = BytesMut::new();

        let resp = ExecutionResponse::failure(5, ErrorClass::Timeout, "deadline", 1234);
        codec.encode(resp.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, resp);
    }

    #[test]
    fn record_codec_rejects_wrong_message_type() {
        let mut writer = RecordCodec::<ExecutionResponse>::new();
        let mut buf = BytesMut::new();
        writer
            .encode(ExecutionResponse::success(1, Vec::new(), 0), &mut buf)
            .unwrap();

        let mut reader = RecordCodec::<ExecutionRequest>::new();
        assert!(matches!(
            reader.decode(&mut buf),
            Err(FrameError::UnexpectedMessageType { .. })
        ));
    }

    #[test]
    fn record_codec_rejects_malformed_body() {
        let mut frames = FrameCodec::new();
        let mut buf = BytesMut::new();
        frames
            .encode(
                RawFrame::new(MessageType::ExecuteRequest, &b"{not json"[..]),
                &mut buf,
            )
            .unwrap();

        let mut reader = RecordCodec::<ExecutionRequest>::new();
        assert!(matches!(
            reader.decode(&mut buf),
            Err(FrameError::MalformedRecord(_))
        ));
    }

    #[tokio::test]
    async fn framed_read_handles_arbitrary_chunking() {
        let mut wire = BytesMut::new();
        let mut codec = RecordCodec::<ExecutionRequest>::new();
        for id in 0..5 {
            codec.encode(request(id), &mut wire).unwrap();
        }
        let wire = wire.freeze();

        for chunk_size in [1usize, 3, 7, 64] {
            // Tiny duplex buffer forces many short reads on the other side.
            let (mut tx, rx) = tokio::io::duplex(5);
            let bytes = wire.clone();
            let writer = tokio::spawn(async move {
                for chunk in bytes.chunks(chunk_size) {
                    tx.write_all(chunk).await.unwrap();
                }
            });

            let mut reader = FramedRead::new(rx, RecordCodec::<ExecutionRequest>::new());
            for id in 0..5 {
                let decoded = reader.next().await.unwrap().unwrap();
                assert_eq!(decoded, request(id), "chunk size {chunk_size}");
            }
            writer.await.unwrap();
            assert!(reader.next().await.is_none());
        }
    }
}

//! Length-prefixed codec for frames and envelopes over async streams

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX: usize = 4;

/// A message that can be carried inside a length-prefixed frame
pub trait WireMessage: Sized {
    /// Serialize the message body (without length prefix)
    fn to_wire(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Deserialize a message body
    fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

/// Codec for encoding/decoding length-prefixed messages over async streams
pub struct FrameCodec<T = Frame> {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
    _message: PhantomData<fn() -> T>,
}

impl<T: WireMessage> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireMessage> FrameCodec<T> {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
            _message: PhantomData,
        }
    }

    /// Encode a message to bytes with length prefix
    pub fn encode_frame(&self, message: &T) -> Result<Bytes, ProtocolError> {
        let body = message.to_wire()?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Write a message to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, message: &T) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(message)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a message from an async reader. `Ok(None)` on clean EOF.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<T>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.try_decode_frame()? {
                return Ok(Some(message));
            }

            let n = reader.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidFrame);
                }
            }
        }
    }

    /// Try to decode a message from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<T>, ProtocolError> {
        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let frame_len = (&self.read_buf[..LENGTH_PREFIX]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < LENGTH_PREFIX + frame_len {
            self.read_buf.reserve(LENGTH_PREFIX + frame_len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        let body = self.read_buf.split_to(frame_len);

        T::from_wire(&body).map(Some)
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameFlags;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_encode_decode() {
        let codec = FrameCodec::<Frame>::new();
        let frame = Frame::data(1, true, Bytes::from("test payload"));

        let encoded = codec.encode_frame(&frame).unwrap();
        assert!(encoded.len() > LENGTH_PREFIX);

        let mut codec2 = FrameCodec::<Frame>::new();
        let mut cursor = Cursor::new(encoded);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(frame.channel_id, decoded.channel_id);
        assert_eq!(frame.flags, decoded.flags);
        assert_eq!(frame.payload, decoded.payload);
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let codec = FrameCodec::<Frame>::new();
        let frame = Frame::end_stream(123, false);

        let mut buffer = Vec::new();
        codec.write_frame(&mut buffer, &frame).await.unwrap();

        let mut codec2 = FrameCodec::<Frame>::new();
        let mut cursor = Cursor::new(buffer);
        let decoded = codec2.read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(frame.channel_id, decoded.channel_id);
        assert!(decoded.is_end_stream());
    }

    #[tokio::test]
    async fn test_partial_frame_reading() {
        let codec = FrameCodec::<Frame>::new();
        let frame = Frame::data(1, false, Bytes::from("test"));
        let encoded = codec.encode_frame(&frame).unwrap();

        let mut codec2 = FrameCodec::<Frame>::new();

        let mid = encoded.len() / 2;
        codec2.read_buf.extend_from_slice(&encoded[..mid]);
        assert!(codec2.try_decode_frame().unwrap().is_none());

        codec2.read_buf.extend_from_slice(&encoded[mid..]);
        let decoded = codec2.try_decode_frame().unwrap().unwrap();

        assert_eq!(frame.channel_id, decoded.channel_id);
        assert_eq!(frame.payload, decoded.payload);
        assert_eq!(codec2.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_buffer() {
        let codec = FrameCodec::<Frame>::new();
        let frame1 = Frame::data(1, true, Bytes::from("first"));
        let frame2 = Frame::data(2, true, Bytes::from("second"));

        let mut combined = BytesMut::new();
        combined.extend_from_slice(&codec.encode_frame(&frame1).unwrap());
        combined.extend_from_slice(&codec.encode_frame(&frame2).unwrap());

        let mut codec2 = FrameCodec::<Frame>::new();
        let mut cursor = Cursor::new(combined.freeze());

        let decoded1 = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame1.payload, decoded1.payload);

        let decoded2 = codec2.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame2.payload, decoded2.payload);

        assert!(codec2.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let codec = FrameCodec::<Frame>::with_max_frame_size(100);
        let frame = Frame::data(1, true, Bytes::from(vec![0u8; 200]));

        let result = codec.encode_frame(&frame);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let mut codec = FrameCodec::<Frame>::with_max_frame_size(16);
        let mut data = BytesMut::new();
        data.put_u32(1024);
        data.put_slice(&[0u8; 8]);

        let mut cursor = Cursor::new(data.freeze());
        let result = codec.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 1024, max: 16 })));
    }

    #[tokio::test]
    async fn test_invalid_frame_data() {
        let mut codec = FrameCodec::<Frame>::new();

        let mut invalid_data = BytesMut::new();
        invalid_data.put_u32(4);
        invalid_data.put_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

        let mut cursor = Cursor::new(invalid_data.freeze());
        let result = codec.read_frame(&mut cursor).await;

        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let codec = FrameCodec::<Frame>::new();
        let encoded = codec.encode_frame(&Frame::data(1, true, Bytes::from("abc"))).unwrap();

        let mut codec2 = FrameCodec::<Frame>::new();
        let mut cursor = Cursor::new(encoded.slice(..encoded.len() - 1));
        let result = codec2.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut codec = FrameCodec::<Frame>::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());

        let result = codec.read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    proptest! {
        #[test]
        fn test_codec_roundtrip_properties(
            channel_id in any::<u32>(),
            flags in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..1000)
        ) {
            tokio_test::block_on(async {
                let codec = FrameCodec::<Frame>::new();
                let frame = Frame::new(channel_id, FrameFlags(flags), Bytes::from(payload));

                let encoded = codec.encode_frame(&frame)?;

                let mut codec2 = FrameCodec::<Frame>::new();
                let mut cursor = Cursor::new(encoded);
                let decoded = codec2.read_frame(&mut cursor).await?.unwrap();

                prop_assert_eq!(frame.channel_id, decoded.channel_id);
                prop_assert_eq!(frame.flags, decoded.flags);
                prop_assert_eq!(frame.payload, decoded.payload);

                Ok(())
            })?;
        }
    }
}

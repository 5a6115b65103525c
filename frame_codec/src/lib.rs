//! Length-prefixed framing shared by the detection client and server.
//!
//! Wire format (version 1):
//!
//! ```text
//! +----------------------+-------------------------+
//! | length: u64 (BE, 8B) | payload: `length` bytes |
//! +----------------------+-------------------------+
//! ```
//!
//! One frame travels in each direction per connection. The payload is opaque
//! to the codec; in practice it is an encoded image.

mod error;

pub use error::CodecError;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length prefix in bytes.
pub const HEADER_LEN: usize = 8;

/// Default upper bound for a single payload (256 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;

const INITIAL_READ_CAPACITY: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload_size: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_payload_size: u64) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> u64 {
        self.max_payload_size
    }

    /// Serializes `payload` into a single frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let size = payload.len() as u64;
        if size > self.max_payload_size {
            return Err(CodecError::Encoding {
                size,
                max: self.max_payload_size,
            });
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u64(size);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Encodes `payload` and writes the whole frame to `writer`.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        tracing::trace!(payload_len = payload.len(), "frame written");
        Ok(())
    }

    /// Reads exactly one frame from `reader` and returns its payload.
    ///
    /// The declared length is checked against the configured maximum before
    /// any payload byte is read. The payload buffer grows as bytes arrive, so
    /// a peer announcing a large frame and then stalling does not cost a
    /// large allocation.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Vec<u8>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(CodecError::Truncated {
                    expected: HEADER_LEN as u64,
                    received: filled as u64,
                });
            }
            filled += n;
        }

        let length = u64::from_be_bytes(header);
        if length > self.max_payload_size {
            return Err(CodecError::InvalidLength {
                length,
                max: self.max_payload_size,
            });
        }

        let capacity = length.min(INITIAL_READ_CAPACITY) as usize;
        let mut payload = Vec::with_capacity(capacity);
        let received = (&mut *reader).take(length).read_to_end(&mut payload).await? as u64;
        if received < length {
            return Err(CodecError::Truncated {
                expected: HEADER_LEN as u64 + length,
                received: HEADER_LEN as u64 + received,
            });
        }

        tracing::trace!(payload_len = length, "frame read");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn sample_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let codec = FrameCodec::default();
        let frame = codec.encode(b"abc").unwrap();

        assert_eq!(&frame[..HEADER_LEN], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&frame[HEADER_LEN..], b"abc");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::new(4);

        let err = codec.encode(&[0u8; 5]).unwrap_err();

        assert!(matches!(err, CodecError::Encoding { size: 5, max: 4 }));
        assert!(codec.encode(&[0u8; 4]).is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_across_partial_reads() {
        let codec = FrameCodec::default();
        // A tiny pipe forces both sides through many short reads and writes.
        let (mut client, mut server) = duplex(7);

        for len in [0usize, 1, 8, 1024, 100_003] {
            let payload = sample_payload(len);
            let writer_payload = payload.clone();
            let writer = tokio::spawn(async move {
                codec.write_frame(&mut client, &writer_payload).await.unwrap();
                client
            });

            let decoded = codec.decode(&mut server).await.unwrap();
            client = writer.await.unwrap();

            assert_eq!(decoded, payload);
        }
    }

    #[tokio::test]
    async fn test_decode_reports_truncated_payload() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&sample_payload(32)).unwrap();

        for cut in [1, HEADER_LEN - 1, HEADER_LEN, HEADER_LEN + 31] {
            let mut stream = &frame[..cut];
            let err = codec.decode(&mut stream).await.unwrap_err();

            match err {
                CodecError::Truncated { expected, received } => {
                    assert_eq!(received, cut as u64);
                    assert!(expected > received);
                }
                other => panic!("expected truncation, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_decode_empty_stream_is_truncated() {
        let codec = FrameCodec::default();
        let mut stream: &[u8] = &[];

        let err = codec.decode(&mut stream).await.unwrap_err();

        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 8,
                received: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_decode_rejects_length_over_limit_without_reading_payload() {
        let codec = FrameCodec::new(16);
        let mut bytes = 17u64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xAA; 17]);
        let mut stream = &bytes[..];

        let err = codec.decode(&mut stream).await.unwrap_err();

        assert!(matches!(err, CodecError::InvalidLength { length: 17, max: 16 }));
        assert_eq!(stream.len(), 17);
    }

    #[tokio::test]
    async fn test_decode_huge_declared_length() {
        let codec = FrameCodec::default();
        let bytes = u64::MAX.to_be_bytes();
        let mut stream = &bytes[..];

        let err = codec.decode(&mut stream).await.unwrap_err();

        assert!(matches!(err, CodecError::InvalidLength { length: u64::MAX, .. }));
    }

    #[tokio::test]
    async fn test_decode_leaves_trailing_bytes_unread() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(b"first").unwrap().to_vec();
        bytes.extend_from_slice(&codec.encode(b"second").unwrap());
        let mut stream = &bytes[..];

        assert_eq!(codec.decode(&mut stream).await.unwrap(), b"first");
        assert_eq!(codec.decode(&mut stream).await.unwrap(), b"second");
    }
}

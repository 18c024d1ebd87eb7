use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::FrameError;

/// Streaming frame codec for use with `FramedRead`/`FramedWrite`.
///
/// Buffers partial input until a whole frame is available. A connection that
/// ends in the middle of a frame yields [`FrameError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    /// Create a codec with the default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a codec with custom configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Maximum accepted payload length.
    pub fn max_payload_size(&self) -> usize {
        self.config.max_payload_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        decode_frame(src, self.config.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::codec::encode;
    use crate::kind::FrameKind;

    #[tokio::test]
    async fn write_then_read() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, FrameCodec::new());
        let mut reader = FramedRead::new(server, FrameCodec::new());

        writer
            .send(Frame::new(FrameKind::Open, 1, vec![0x01, 127, 0, 0, 1, 0, 80]))
            .await
            .unwrap();
        writer
            .send(Frame::new(FrameKind::Data, 1, "payload"))
            .await
            .unwrap();
        drop(writer);

        let open = reader.next().await.unwrap().unwrap();
        assert_eq!(open.kind, FrameKind::Open);
        let data = reader.next().await.unwrap().unwrap();
        assert_eq!(data.payload.as_ref(), b"payload");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn byte_by_byte_delivery() {
        let frame = Frame::new(FrameKind::Data, 42, "split across many reads");
        let wire = encode(&frame).unwrap();

        let (mut client, server) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            for byte in wire.iter() {
                client.write_all(&[*byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FramedRead::new(server, FrameCodec::new());
        let decoded = reader.next().await.unwrap().unwrap();
        assert_eq!(decoded, frame);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_frame_is_connection_closed() {
        let wire = encode(&Frame::new(FrameKind::Data, 3, "truncated")).unwrap();

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&wire[..wire.len() - 2]).await.unwrap();
        drop(client);

        let mut reader = FramedRead::new(server, FrameCodec::new());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn oversized_header_fails_before_payload_arrives() {
        let (mut client, server) = tokio::io::duplex(64);
        // DATA on stream 1 declaring a 1 MiB payload, nothing after the header.
        client
            .write_all(&[0x02, 0, 0, 0, 1, 0x00, 0x10, 0x00, 0x00])
            .await
            .unwrap();

        let codec = FrameCodec::with_config(FrameConfig {
            max_payload_size: 1024,
        });
        let mut reader = FramedRead::new(server, codec);
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn encoder_enforces_max_payload() {
        let mut codec = FrameCodec::with_config(FrameConfig {
            max_payload_size: 4,
        });
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::new(FrameKind::Data, 1, "too long"), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 8, max: 4 }));
        assert!(dst.is_empty());
    }
}

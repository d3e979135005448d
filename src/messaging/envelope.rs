use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::messaging::message::{Message, Payload, StructuredPayload};
use crate::util::safe_converter::PrecheckedCast;

/// Failures reading a frame that leave the stream in an undefined state, i.e. the connection
///  can not be used any further.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error reading frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended in the middle of a frame ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },
    #[error("frame header announces negative payload size {0}")]
    NegativeSize(i32),
    #[error("frame payload of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

/// Fixed-size frame header preceding every message on the wire:
///
/// ```ascii
/// 0: message type (i32 BE)
/// 4: payload size in bytes (i32 BE)
/// 8: message id (i64 BE), -1 if unset
/// 16: raw flag (u8): 1 for raw payload, 0 for structured
/// 17: 3 bytes padding, written as zero and ignored on read
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Envelope {
    pub message_type: i32,
    pub payload_size: i32,
    pub message_id: i64,
    pub raw: bool,
}

impl Envelope {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.message_type);
        buf.put_i32(self.payload_size);
        buf.put_i64(self.message_id);
        buf.put_u8(if self.raw { 1 } else { 0 });
        buf.put_slice(&[0, 0, 0]);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let message_type = buf.try_get_i32()?;
        let payload_size = buf.try_get_i32()?;
        let message_id = buf.try_get_i64()?;
        let raw = buf.try_get_u8()? != 0;
        if buf.remaining() < 3 {
            anyhow::bail!("frame header padding is missing");
        }
        buf.advance(3);

        Ok(Envelope {
            message_type,
            payload_size,
            message_id,
            raw,
        })
    }

    /// Interprets a frame's payload as a message. Failure here affects only this message, the
    ///  stream itself is still in sync.
    pub fn decode_message(&self, mut payload: Bytes) -> anyhow::Result<Message> {
        let payload = if self.raw {
            Payload::Raw(payload)
        }
        else {
            Payload::Structured(StructuredPayload::deser(&mut payload)?)
        };
        Ok(Message::received(self.message_type, self.message_id, payload))
    }
}

/// Appends a message's complete frame (header and payload) to a buffer
pub fn encode_frame(message: &Message, buf: &mut BytesMut) -> anyhow::Result<()> {
    let mut payload_buf = BytesMut::new();
    message.payload().ser(&mut payload_buf);

    let payload_size: i32 = match i32::try_from(payload_buf.len()) {
        Ok(size) => size,
        Err(_) => anyhow::bail!("payload of {} bytes does not fit into a frame", payload_buf.len()),
    };

    buf.reserve(Envelope::SERIALIZED_LEN + payload_buf.len());
    Envelope {
        message_type: message.message_type(),
        payload_size,
        message_id: message.message_id(),
        raw: message.is_raw_payload(),
    }.ser(buf);
    buf.put_slice(&payload_buf);
    Ok(())
}

/// Reads the next frame from a stream. `Ok(None)` signals that the stream ended cleanly at a frame
///  boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_message_size: usize) -> Result<Option<(Envelope, Bytes)>, FrameError> {
    let mut header_buf = [0u8; Envelope::SERIALIZED_LEN];
    let mut filled = 0;
    while filled < header_buf.len() {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated { expected: Envelope::SERIALIZED_LEN, got: filled });
        }
        filled += n;
    }

    // the header buffer has exactly the right size, so this can not fail
    let envelope = match Envelope::deser(&mut header_buf.as_ref()) {
        Ok(envelope) => envelope,
        Err(e) => return Err(FrameError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))),
    };

    if envelope.payload_size < 0 {
        return Err(FrameError::NegativeSize(envelope.payload_size));
    }
    let payload_size: usize = envelope.payload_size.prechecked_cast();
    if payload_size > max_message_size {
        return Err(FrameError::TooLarge { size: payload_size, max: max_message_size });
    }

    let mut payload = BytesMut::zeroed(payload_size);
    let mut filled = 0;
    while filled < payload_size {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated { expected: Envelope::SERIALIZED_LEN + payload_size, got: Envelope::SERIALIZED_LEN + filled });
        }
        filled += n;
    }

    trace!("read frame {:?}", envelope);
    Ok(Some((envelope, payload.freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use crate::messaging::system_types::SystemMessageType;

    #[rstest]
    #[case::structured(Envelope { message_type: 5, payload_size: 3, message_id: -1, raw: false }, vec![0,0,0,5, 0,0,0,3, 255,255,255,255,255,255,255,255, 0, 0,0,0])]
    #[case::raw(Envelope { message_type: 1, payload_size: 256, message_id: 2, raw: true }, vec![0,0,0,1, 0,0,1,0, 0,0,0,0,0,0,0,2, 1, 0,0,0])]
    #[case::system(Envelope { message_type: -2, payload_size: 0, message_id: 0x0102030405060708, raw: false }, vec![255,255,255,254, 0,0,0,0, 1,2,3,4,5,6,7,8, 0, 0,0,0])]
    fn test_envelope_ser(#[case] envelope: Envelope, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), Envelope::SERIALIZED_LEN);

        let deser = Envelope::deser(&mut buf.as_ref()).unwrap();
        assert_eq!(deser, envelope);
    }

    #[test]
    fn test_envelope_ignores_padding() {
        let buf = vec![0,0,0,5, 0,0,0,0, 0,0,0,0,0,0,0,9, 1, 7,8,9];
        let envelope = Envelope::deser(&mut buf.as_slice()).unwrap();
        assert_eq!(envelope, Envelope { message_type: 5, payload_size: 0, message_id: 9, raw: true });
    }

    #[test]
    fn test_envelope_too_short() {
        let buf = vec![0,0,0,5, 0,0,0,0, 0,0,0,0,0,0,0,9, 1, 0];
        assert!(Envelope::deser(&mut buf.as_slice()).is_err());
    }

    #[tokio::test]
    async fn test_read_frames_in_small_chunks() {
        let (mut client, mut server) = tokio::io::duplex(7);

        let first = Message::new(3, StructuredPayload::new().with("a", "b")).unwrap()
            .with_message_id(77);
        let second = Message::new(4, vec![9u8; 100]).unwrap();
        let third = Message::system(SystemMessageType::PingPong, StructuredPayload::new());

        let mut buf = BytesMut::new();
        for msg in [&first, &second, &third] {
            encode_frame(msg, &mut buf).unwrap();
        }
        let writer = tokio::spawn(async move {
            client.write_all(&buf).await.unwrap();
        });

        let mut received = Vec::new();
        while let Some((envelope, payload)) = read_frame(&mut server, 1024).await.unwrap() {
            received.push(envelope.decode_message(payload).unwrap());
        }
        writer.await.unwrap();

        assert_eq!(received, vec![first, second, third]);
        assert!(received[0].received_at().is_some());
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 1024).await.unwrap().is_none());
    }

    #[rstest]
    #[case::in_header(vec![0,0,0,5, 0,0])]
    #[case::in_payload(vec![0,0,0,5, 0,0,0,4, 0,0,0,0,0,0,0,1, 1, 0,0,0, 1,2])]
    #[tokio::test]
    async fn test_read_frame_truncated(#[case] data: Vec<u8>) {
        let mut reader = data.as_slice();
        let result = read_frame(&mut reader, 1024).await;
        assert!(matches!(result, Err(FrameError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_read_frame_negative_size() {
        let data = vec![0,0,0,5, 255,255,255,255, 0,0,0,0,0,0,0,1, 1, 0,0,0];
        let result = read_frame(&mut data.as_slice(), 1024).await;
        assert!(matches!(result, Err(FrameError::NegativeSize(-1))));
    }

    #[tokio::test]
    async fn test_read_frame_oversized() {
        let data = vec![0,0,0,5, 0,0,4,1, 0,0,0,0,0,0,0,1, 1, 0,0,0];
        let result = read_frame(&mut data.as_slice(), 1024).await;
        assert!(matches!(result, Err(FrameError::TooLarge { size: 1025, max: 1024 })));
    }

    #[tokio::test]
    async fn test_undecodable_payload_keeps_stream_in_sync() {
        let mut buf = BytesMut::new();
        Envelope { message_type: 3, payload_size: 2, message_id: -1, raw: false }.ser(&mut buf);
        buf.put_slice(&[5, 1]);
        encode_frame(&Message::new(4, vec![1u8]).unwrap(), &mut buf).unwrap();

        let mut reader = buf.as_ref();
        let (envelope, payload) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert!(envelope.decode_message(payload).is_err());

        let (envelope, payload) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let msg = envelope.decode_message(payload).unwrap();
        assert_eq!(msg.message_type(), 4);
        assert_eq!(msg.raw().unwrap().as_ref(), &[1u8]);
    }
}

//! Length-prefixed frames: `[len: u32 BE][JSON Envelope]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::message::Envelope;

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serialize `envelope` into a complete frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(envelope).map_err(|e| TransportError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream.
///
/// A frame that decodes but fails [`Message::validate`](crate::Message::validate)
/// is consumed and reported as `InvalidMessage`, so the caller may keep reading.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let envelope: Envelope =
        serde_json::from_slice(&payload).map_err(|e| TransportError::Codec(e.to_string()))?;
    envelope.message.validate()?;
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn heartbeat(from: &str) -> Envelope {
        Envelope {
            from: from.into(),
            message: Message::Heartbeat {
                node_id: from.into(),
                last_committed_version: 3,
                digest: "ab".repeat(32),
            },
        }
    }

    #[tokio::test]
    async fn frames_are_delimited_on_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &heartbeat("node-a")).await.unwrap();
        write_frame(&mut client, &heartbeat("node-b")).await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap().unwrap();
        let second = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(first.from, "node-a");
        assert_eq!(second.from, "node-b");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_payload_is_a_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[tokio::test]
    async fn invalid_message_is_consumed_and_reported() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let bad = Envelope {
            from: "node-a".into(),
            message: Message::PrepareResp {
                txid: String::new(),
                vote: canary_state::Decision::Commit,
                reason: String::new(),
            },
        };
        write_frame(&mut client, &bad).await.unwrap();
        write_frame(&mut client, &heartbeat("node-a")).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
        let next = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(next, heartbeat("node-a"));
    }
}

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Error::*, Result};

/// Every framed message starts with its length as a big-endian u64.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Written to an endpoint once the signal has finished admitting or
/// releasing it.
pub const OPERATION_SUCCESS: u8 = 1;

/// A negotiation message. The swarm core never looks inside one beyond
/// asking whether the acceptor agreed to the session.
pub trait NegotiateMessage: Send {
    fn is_accepted(&self) -> bool;
}

/// Turns a raw acceptor response into a [`NegotiateMessage`]. Injected so
/// that the encoding stays out of the core.
pub type MessageDecoder =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn NegotiateMessage>> + Send + Sync>;

/// Reads one length-prefixed message, blocking until all of it has arrived.
pub async fn read_message<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut len_buf).await?;
    let len = BigEndian::read_u64(&len_buf);
    if len > max_len {
        Err(MessageLengthOverflowed(len))?
    }
    let mut msg_buf = vec![0u8; len as usize];
    reader.read_exact(&mut msg_buf).await?;
    Ok(msg_buf)
}

/// Writes one length-prefixed message.
pub async fn write_message<W>(writer: &mut W, msg: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + msg.len());
    buf.extend_from_slice(&(msg.len() as u64).to_be_bytes());
    buf.extend_from_slice(msg);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A session description exchanged between an offering and an accepting
/// peer, encoded as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Set by the acceptor on the answer that concludes the negotiation.
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            accepted: false,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>, accepted: bool) -> Self {
        Self {
            accepted,
            sdp: sdp.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CouldNotEncodeMessage(e.to_string()))
    }
}

impl NegotiateMessage for SessionDescription {
    fn is_accepted(&self) -> bool {
        self.accepted
    }
}

/// Decodes acceptor responses as JSON [`SessionDescription`]s.
pub fn session_description_decoder() -> MessageDecoder {
    Arc::new(|raw| {
        let msg: SessionDescription = serde_json::from_slice(raw)
            .map_err(|e| CouldNotDecodeMessage(e.to_string()))?;
        Ok(Box::new(msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_message_survives_the_wire() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        let payload = b"v=0 o=- 4611731400430051336 2 IN IP4 127.0.0.1".to_vec();

        let sent = payload.clone();
        let write_handle = tokio::spawn(async move {
            write_message(&mut writer, &sent).await.unwrap();
        });

        let received = read_message(&mut reader, 1024).await.unwrap();
        write_handle.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn prefix_is_big_endian_u64() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_message(&mut writer, b"abc").await.unwrap();

        let mut raw = [0u8; LENGTH_PREFIX_BYTES + 3];
        reader.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[..LENGTH_PREFIX_BYTES], [0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&raw[LENGTH_PREFIX_BYTES..], b"abc");
    }

    #[tokio::test]
    async fn rejects_oversized_messages() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&u64::MAX.to_be_bytes()).await.unwrap();

        let err = read_message(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, MessageLengthOverflowed(u64::MAX)));
    }

    #[tokio::test]
    async fn truncated_message_is_an_io_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&10u64.to_be_bytes()).await.unwrap();
        writer.write_all(b"short").await.unwrap();
        drop(writer);

        let err = read_message(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, Io(_)));
    }

    #[test]
    fn decodes_acceptance() {
        let decode = session_description_decoder();
        let accepted = SessionDescription::answer("answer", true).encode().unwrap();
        let pending = SessionDescription::offer("offer").encode().unwrap();

        assert!(decode(&accepted).unwrap().is_accepted());
        assert!(!decode(&pending).unwrap().is_accepted());
        assert!(matches!(
            decode(b"not json"),
            Err(CouldNotDecodeMessage(_))
        ));
    }
}

//! Framing for the local IPC channel: a u32 big-endian length prefix
//! followed by one msgpack-encoded message.

use std::io::{self, ErrorKind};

use rmp_serde::{from_slice, to_vec_named};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single IPC frame. Commands and events are small; a
/// larger frame is a protocol violation, not a big payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode_frame<T: Serialize>(message: &T) -> io::Result<Vec<u8>> {
    let payload =
        to_vec_named(message).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    if bytes.len() < 4 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "missing frame header"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[..4]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if bytes.len() < 4 + len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "incomplete frame"));
    }
    from_slice(&bytes[4..4 + len]).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode_frame(message)?;
    writer.write_all(&framed).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame too large"));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    from_slice(&payload).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{decode_frame, encode_frame};

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Sample {
        id: u64,
        text: String,
    }

    #[test]
    fn frame_roundtrip() {
        let message = Sample { id: 7, text: "status".into() };
        let framed = encode_frame(&message).expect("encodes");
        let decoded: Sample = decode_frame(&framed).expect("decodes");
        assert_eq!(decoded, message);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(decode_frame::<Sample>(&[0, 0, 0, 10, 1, 2]).is_err());
    }
}

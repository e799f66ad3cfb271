//! Length-prefixed JSON framing over stdin/stdout.
//!
//! `[uint32 length, little-endian][UTF-8 JSON bytes]`. No corpus example speaks this wire format
//! (`beach-road` talks HTTP/WebSocket); implemented directly using the same `tokio::io` async-io
//! idiom `beach-road` uses for its own I/O.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HostError;

/// Reads exactly one framed message, or `Ok(None)` if the stream hit EOF before any bytes arrived
/// (the clean-exit case). A partial length prefix or a short body is a [`HostError::Protocol`].
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, HostError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        BytesRead::Eof => return Ok(None),
        BytesRead::Partial => {
            return Err(HostError::Protocol(
                "eof before complete length prefix".into(),
            ))
        }
        BytesRead::Full => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| HostError::Protocol(format!("short read of message body: {e}")))?;

    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Writes one framed message.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .map_err(|_| HostError::Protocol("message too large to frame".into()))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

enum BytesRead {
    Full,
    Partial,
    Eof,
}

/// Reads into `buf`, distinguishing "EOF before any byte" (clean shutdown) from "EOF after some
/// bytes but before the buffer is full" (a protocol violation).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<BytesRead, HostError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                BytesRead::Eof
            } else {
                BytesRead::Partial
            });
        }
        filled += n;
    }
    Ok(BytesRead::Full)
}

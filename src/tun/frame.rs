//! Length-delimited JSON frames.
//!
//! Wire format: 4-byte big-endian length prefix followed by a JSON payload.

use bytes::BytesMut;
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read one frame. `Ok(None)` when the peer closed cleanly between frames.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<BytesMut>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes", data.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read and decode one message. A clean close surfaces as `Ok(None)`.
pub(crate) async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|err| Error::Connection(format!("malformed frame: {err}"))),
        None => Ok(None),
    }
}

/// Like [`read_message`], but a closed stream is an error.
pub(crate) async fn expect_message<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    read_message(reader)
        .await?
        .ok_or_else(|| Error::Connection("connection closed".to_string()))
}

pub(crate) async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let data = serde_json::to_vec(message)
        .map_err(|err| Error::Connection(format!("failed to encode frame: {err}")))?;
    write_frame(writer, &data).await?;
    Ok(())
}

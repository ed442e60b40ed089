//! Length-prefixed frames
//!
//! Every frame is a big-endian `u32` length followed by that many bytes.
//! A broadcast travels as two consecutive frames: topic, then payload.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use parley_core::service::transport::{Publication, TransportError};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 4;

pub fn encode_frame(payload: &[u8]) -> Result<Bytes, TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut header = Vec::with_capacity(HEADER_LEN);
    WriteBytesExt::write_u32::<BigEndian>(&mut header, payload.len() as u32)?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` when the peer closed the connection between frames
///
/// A connection closed part way through a header or body is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed after {} of {} header bytes", filled, HEADER_LEN),
            )
            .into());
        }
        filled += n;
    }

    let len = ReadBytesExt::read_u32::<BigEndian>(&mut Cursor::new(header))? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_publication<W>(writer: &mut W, publication: &Publication) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = BytesMut::new();
    frames.extend_from_slice(&encode_frame(publication.topic.as_bytes())?);
    frames.extend_from_slice(&encode_frame(&publication.payload)?);
    writer.write_all(&frames).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a topic frame and its payload frame
pub async fn read_publication<R>(reader: &mut R) -> Result<Option<Publication>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let Some(topic) = read_frame(reader).await? else {
        return Ok(None);
    };
    let payload = read_frame(reader).await?.ok_or(TransportError::Closed)?;
    Ok(Some(Publication {
        topic: String::from_utf8_lossy(&topic).into_owned(),
        payload,
    }))
}

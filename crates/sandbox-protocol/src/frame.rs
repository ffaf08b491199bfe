use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Default oversize cap enforced before a frame's payload is allocated.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 100 * 1024 * 1024;

/// Writes one length-prefixed frame and flushes the stream.
///
/// `payload.len()` must fit in a `u32`; callers that hand the Wire Codec's
/// encoded envelope to this function never exceed that in practice, since
/// [`DEFAULT_MAX_FRAME_LEN`] is itself well under `u32::MAX`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::OversizeFrame {
        len: u32::MAX,
        max: u32::MAX,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end-of-stream observed before any length
/// byte arrives. Returns `Err(FramingError::UnexpectedEof)` if the stream
/// ends mid-length or mid-payload. The length is checked against `max_len`
/// *before* the payload buffer is allocated, so an oversize frame never
/// triggers an allocation.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Bytes>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let len = match read_length_prefix(reader).await? {
        None => return Ok(None),
        Some(len) => len,
    };
    if len > max_len {
        return Err(FramingError::OversizeFrame { len, max: max_len });
    }
    if len == 0 {
        return Ok(Some(Bytes::new()));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(map_eof_mid_frame)?;
    Ok(Some(Bytes::from(buf)))
}

async fn read_length_prefix<R>(reader: &mut R) -> Result<Option<u32>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FramingError::UnexpectedEof)
            };
        }
        filled += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

fn map_eof_mid_frame(err: std::io::Error) -> FramingError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FramingError::UnexpectedEof
    } else {
        FramingError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_nonempty_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&decoded[..], b"hello");
    }

    #[tokio::test]
    async fn round_trips_zero_length_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn pre_frame_eof_is_clean_close() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mid_length_eof_is_hard_error() {
        let mut cursor = Cursor::new(vec![0x01, 0x02]);
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(FramingError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn mid_payload_eof_is_hard_error() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(bytes);
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(FramingError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_before_allocating() {
        let mut bytes = (DEFAULT_MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"short"); // far too short for the claimed length
        let mut cursor = Cursor::new(bytes);
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(FramingError::OversizeFrame { .. })));
    }
}

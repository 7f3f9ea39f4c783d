//! Length-prefixed frame codec
//!
//! Each frame is a little-endian `u32` payload length followed by exactly that
//! many bytes. A stream that ends partway through a frame is a clean end of
//! stream: the partial frame is discarded and never handed to the caller.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length field that precedes every payload
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Most buffer space reserved ahead of payload bytes actually arriving
const MAX_PREALLOC: usize = 64 * 1024;

/// Encoder/decoder for length-prefixed frames.
///
/// No frame size limit is enforced unless one is set with
/// [`FrameCodec::with_max_frame_length`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_length: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames whose payload is longer than `max` bytes
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            max_frame_length: Some(max),
        }
    }

    pub fn max_frame_length(&self) -> Option<usize> {
        self.max_frame_length
    }

    fn check_length(&self, len: usize) -> io::Result<()> {
        match self.max_frame_length {
            Some(max) if len > max => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {} bytes", len, max),
            )),
            _ => Ok(()),
        }
    }

    /// Read one frame from a raw reader.
    ///
    /// Returns `Ok(None)` when the stream ends before a complete frame is
    /// available.
    pub async fn read_frame<R>(&self, reader: &mut R) -> io::Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        if !read_exact_or_eof(reader, &mut header).await? {
            return Ok(None);
        }

        let len = u32::from_le_bytes(header) as usize;
        self.check_length(len)?;

        // The buffer grows with the bytes that arrive, not with the header's claim
        let mut payload = BytesMut::with_capacity(len.min(MAX_PREALLOC));
        let mut limited = (&mut *reader).take(len as u64);
        while payload.len() < len {
            if limited.read_buf(&mut payload).await? == 0 {
                return Ok(None);
            }
        }
        Ok(Some(payload.freeze()))
    }

    /// Write one frame to a raw writer as a single buffer, then flush
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        self.put_frame(payload, &mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await
    }

    fn put_frame(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes does not fit a u32 length", payload.len()),
            )
        })?;
        self.check_length(payload.len())?;

        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32_le(len);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

/// `read_exact` that reports a short read as `false` instead of an error
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let Some(header) = src.get(..LENGTH_PREFIX_LEN) else {
            return Ok(None);
        };

        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        len_bytes.copy_from_slice(header);
        let len = u32::from_le_bytes(len_bytes) as usize;
        self.check_length(len)?;

        let frame_len = LENGTH_PREFIX_LEN + len;
        if src.len() < frame_len {
            src.reserve((frame_len - src.len()).min(MAX_PREALLOC));
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if !buf.is_empty() {
            log::debug!("Discarding {} bytes of truncated frame at end of stream", buf.len());
            buf.clear();
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        self.put_frame(&item, dst)
    }
}

//! Length-prefixed text frames
//!
//! Every message on a session connection is a 2-byte big-endian length
//! followed by that many bytes of *modified UTF-8*, the encoding legacy peers
//! produce for their length-prefixed strings. It differs from standard UTF-8
//! in two places:
//!
//! - U+0000 is written as the two-byte sequence `C0 80`, never as a raw zero
//! - code points above U+FFFF are written as a UTF-16 surrogate pair, each
//!   half encoded as its own three-byte sequence (six bytes total)
//!
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ len: u16 │ modified UTF-8 (len bytes)   │
//! └──────────┴──────────────────────────────┘
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FrameError, Result, SessionError};

/// Largest encoded payload a frame can carry
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Read buffer granularity for [`FrameReader`]
const READ_CHUNK: usize = 8 * 1024;

/// Encode text as modified UTF-8.
///
/// # Errors
///
/// Returns [`FrameError::TooLong`] if the encoding exceeds [`MAX_FRAME_LEN`].
pub fn encode_modified_utf8(text: &str) -> std::result::Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(text.len());
    let mut units = [0u16; 2];

    for ch in text.chars() {
        let cp = ch as u32;
        if cp != 0 && cp <= 0x7F {
            out.push(cp as u8);
        } else if cp <= 0x7FF {
            out.push(0xC0 | (cp >> 6) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        } else {
            for unit in ch.encode_utf16(&mut units) {
                push_three_byte(&mut out, *unit);
            }
        }
    }

    if out.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(out.len()));
    }
    Ok(out)
}

fn push_three_byte(out: &mut Vec<u8>, unit: u16) {
    out.push(0xE0 | (unit >> 12) as u8);
    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
    out.push(0x80 | (unit & 0x3F) as u8);
}

/// Decode modified UTF-8.
///
/// Unpaired surrogates cannot be represented in a Rust string and are
/// replaced with U+FFFD.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] with the offending byte offset when a
/// lead byte is invalid or a continuation byte is missing.
pub fn decode_modified_utf8(bytes: &[u8]) -> std::result::Result<String, FrameError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b >> 4 {
            0x0..=0x7 => {
                units.push(u16::from(b));
                i += 1;
            }
            0xC | 0xD => {
                let b2 = continuation(bytes, i, 1)?;
                units.push((u16::from(b & 0x1F) << 6) | u16::from(b2 & 0x3F));
                i += 2;
            }
            0xE => {
                let b2 = continuation(bytes, i, 1)?;
                let b3 = continuation(bytes, i, 2)?;
                units.push(
                    (u16::from(b & 0x0F) << 12)
                        | (u16::from(b2 & 0x3F) << 6)
                        | u16::from(b3 & 0x3F),
                );
                i += 3;
            }
            _ => return Err(FrameError::Malformed(i)),
        }
    }

    Ok(char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

fn continuation(bytes: &[u8], lead: usize, offset: usize) -> std::result::Result<u8, FrameError> {
    match bytes.get(lead + offset) {
        Some(&b) if b & 0xC0 == 0x80 => Ok(b),
        _ => Err(FrameError::Malformed(lead)),
    }
}

/// Encode a complete frame (length prefix included).
///
/// # Errors
///
/// Returns [`FrameError::TooLong`] if the text does not fit a frame.
pub fn encode_frame(text: &str) -> std::result::Result<Vec<u8>, FrameError> {
    let payload = encode_modified_utf8(text)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one text frame and flush.
///
/// # Errors
///
/// Returns a frame error for unencodable text, or an I/O error from the writer.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(text)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader.
///
/// [`next_frame`](Self::next_frame) is cancel-safe: dropping it mid-read
/// never loses bytes, so it can sit in a `tokio::select!` next to close
/// signals.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, a transport error for a stream that ends inside a
    /// frame, or a frame error for undecodable payloads.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(text) = self.try_parse()? {
                return Ok(Some(text));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::transport("stream ended inside a frame"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse(&mut self) -> Result<Option<String>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        let text = decode_modified_utf8(&self.buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len])?;
        self.buf.drain(..LENGTH_PREFIX_SIZE + len);
        Ok(Some(text))
    }

    /// Give back the reader and any bytes buffered past the last frame
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf)
    }
}

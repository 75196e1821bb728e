//! Single-message framing over a byte stream.
//!
//! Each direction of a registration stream carries exactly one JSON document.
//! The writer marks the end of the message by shutting down its write
//! direction; the reader consumes the stream up to EOF and parses what it got.
//! There is no length prefix, so the end-of-message signal is the framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on an encoded handshake message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors produced while framing or parsing a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },
    #[error("stream closed before any message bytes arrived")]
    EmptyMessage,
    #[error("encoder has already written its message")]
    AlreadyEncoded,
    #[error("decoder has already read its message")]
    AlreadyDecoded,
    #[error("codec is closed")]
    Closed,
}

/// Serializes `value`, writes it, and half-closes the writer.
///
/// # Errors
///
/// Returns `CodecError::Json` if `value` cannot be serialized,
/// `CodecError::MessageTooLarge` if the encoding exceeds [`MAX_MESSAGE_SIZE`],
/// and `CodecError::Io` if writing or shutting down the stream fails.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            limit: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&bytes).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Reads the stream to EOF and parses the bytes as one `T`.
///
/// # Errors
///
/// Returns `CodecError::EmptyMessage` if the peer closed without writing,
/// `CodecError::MessageTooLarge` if more than [`MAX_MESSAGE_SIZE`] bytes
/// arrive, `CodecError::Json` for malformed or truncated payloads, and
/// `CodecError::Io` for stream failures.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(MAX_MESSAGE_SIZE).unwrap_or(u64::MAX) + 1;
    (&mut *reader).take(limit).read_to_end(&mut buf).await?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            limit: MAX_MESSAGE_SIZE,
        });
    }
    if buf.is_empty() {
        return Err(CodecError::EmptyMessage);
    }

    tracing::trace!(bytes = buf.len(), "decoded framed message");
    Ok(serde_json::from_slice(&buf)?)
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Stream-bound writer for exactly one message.
#[derive(Debug)]
pub struct Encoder<W> {
    writer: Option<W>,
    encoded: bool,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            encoded: false,
        }
    }

    /// Writes `value` and signals end-of-message to the peer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::AlreadyEncoded` on a second call,
    /// `CodecError::Closed` after [`Encoder::close`], and any error from
    /// [`write_message`].
    pub async fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        if self.encoded {
            return Err(CodecError::AlreadyEncoded);
        }
        let writer = self.writer.as_mut().ok_or(CodecError::Closed)?;
        self.encoded = true;
        write_message(writer, value).await
    }

    /// Releases the writer. Idempotent.
    ///
    /// If nothing was encoded, the write direction is shut down so the peer
    /// does not wait for a message that will never come.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Io` if the shutdown of an unused writer fails.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        if let Some(mut writer) = self.writer.take() {
            if !self.encoded {
                writer.shutdown().await?;
            }
        }
        Ok(())
    }

    /// Returns `true` once [`Encoder::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Stream-bound reader for exactly one message.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: Option<R>,
    decoded: bool,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            decoded: false,
        }
    }

    /// Waits for the peer's end-of-message signal and parses the payload.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::AlreadyDecoded` on a second call,
    /// `CodecError::Closed` after [`Decoder::close`], and any error from
    /// [`read_message`].
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        if self.decoded {
            return Err(CodecError::AlreadyDecoded);
        }
        let reader = self.reader.as_mut().ok_or(CodecError::Closed)?;
        self.decoded = true;
        read_message(reader).await
    }

    /// Releases the reader. Idempotent.
    pub fn close(&mut self) {
        self.reader = None;
    }

    /// Returns `true` once [`Decoder::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}

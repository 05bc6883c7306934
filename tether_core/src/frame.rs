use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors arising on the inter-process framed channel.
///
/// The channel has no resynchronization mechanism, so a short read anywhere
/// inside a frame is `Closed`, never a retryable condition.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The other side closed its end of the pipe, or a frame was cut short.
    #[error("framed channel closed")]
    Closed,

    /// The payload does not fit the 2-byte length prefix.
    #[error("payload of {0} bytes exceeds the u16 frame length prefix")]
    Oversize(usize),

    /// Any other I/O failure on the underlying stream.
    #[error("framed channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reading half of the framed channel.
///
/// Wire format: `length:u16-LE ++ payload:byte[length]`. A length of zero is
/// a valid empty payload, distinct from the channel being closed.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive one complete frame, suspending until it is available.
    ///
    /// The length prefix and the payload are two ordered sub-reads; EOF
    /// during either yields [`FrameError::Closed`].
    pub async fn receive(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = match self.inner.read_u16_le().await {
            Ok(len) => usize::from(len),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
            Err(err) => return Err(FrameError::Io(err)),
        };

        let mut payload = vec![0u8; len];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => Ok(payload),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Closed),
            Err(err) => Err(FrameError::Io(err)),
        }
    }
}

/// Writing half of the framed channel.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one frame. Prefix and payload go out in a single buffered write
    /// so a reader can never observe a partial frame boundary.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let len = u16::try_from(payload.len()).map_err(|_| FrameError::Oversize(payload.len()))?;

        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close this direction of the channel.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::protocol::rtu;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("transport is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A half-duplex line carrying one request/response exchange at a time.
///
/// Implementations never retry; a failed exchange is reported as is.
#[async_trait]
pub trait Transport: Send {
    async fn exchange(
        &mut self,
        request: &[u8],
        limit: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Releases the line. Calling it again is a no-op.
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// RTU framing on top of any byte stream: a serial port in production,
/// an in-memory pipe in tests.
pub struct StreamTransport<S> {
    port: Option<S>,
    buf: [u8; rtu::MAX_FRAME_LEN],
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(port: S) -> Self {
        Self {
            port: Some(port),
            buf: [0u8; rtu::MAX_FRAME_LEN],
        }
    }
}

// Bytes left over from an earlier timed-out exchange would otherwise be
// taken as the start of the next response.
async fn discard_stale<S: AsyncRead + Unpin>(port: &mut S, buf: &mut [u8]) -> usize {
    let mut discarded = 0;
    while let Ok(Ok(n)) = timeout(Duration::ZERO, port.read(buf)).await {
        if n == 0 {
            break;
        }
        discarded += n;
    }
    discarded
}

async fn read_frame<S: AsyncRead + Unpin>(port: &mut S) -> Result<Vec<u8>, TransportError> {
    let mut frame = vec![0u8; rtu::HEADER_LEN];
    port.read_exact(&mut frame).await?;

    let len = rtu::response_len(&frame).map_err(TransportError::Framing)?;
    frame.resize(len, 0);
    port.read_exact(&mut frame[rtu::HEADER_LEN..]).await?;

    Ok(frame)
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn exchange(
        &mut self,
        request: &[u8],
        limit: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;

        let stale = discard_stale(port, &mut self.buf).await;
        if stale > 0 {
            debug!("discarded {} stale bytes", stale);
        }

        debug!("send {:02X?}", request);
        port.write_all(request).await?;
        port.flush().await?;

        let frame = timeout(limit, read_frame(port))
            .await
            .map_err(|_| TransportError::Timeout(limit))??;
        debug!("recv {:02X?}", frame);

        Ok(frame)
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                debug!("shutdown failed: {}", e);
            }
            debug!("transport closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

//! Framed TCP transport
//!
//! Messages are written back to back with no outer framing; the reader
//! buffers bytes until [`Decoder`] can cut a whole message off the front.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use cadence_core::{CadenceError, CadenceResult};
use cadence_wire::{Decoder, Message};

use crate::TransportConfig;

/// Reads whole messages from a byte stream
pub struct MessageReader<R> {
    inner: R,
    decoder: Decoder,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        MessageReader {
            inner,
            decoder: Decoder::new(),
        }
    }

    /// Next message. Fails with `ConnectionClosed` on EOF.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered.
    pub async fn read_message(&mut self) -> CadenceResult<Message> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(msg);
            }
            let n = self.inner.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                if self.decoder.pending() > 0 {
                    tracing::debug!(pending = self.decoder.pending(), "stream closed mid-message");
                }
                return Err(CadenceError::ConnectionClosed);
            }
        }
    }

    /// Next message, failing with `Timeout` if none arrives in time
    pub async fn read_message_timeout(&mut self, timeout: Duration) -> CadenceResult<Message> {
        tokio::time::timeout(timeout, self.read_message())
            .await
            .map_err(|_| CadenceError::Timeout(format!("no message within {:?}", timeout)))?
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes messages to a byte stream
pub struct MessageWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        MessageWriter {
            inner,
            buf: BytesMut::with_capacity(256),
        }
    }

    pub async fn write_message(&mut self, msg: &Message) -> CadenceResult<()> {
        self.buf.clear();
        msg.encode(&mut self.buf);
        self.inner.write_all(&self.buf).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> CadenceResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a connected stream into a message reader and writer
pub fn split(stream: TcpStream) -> (MessageReader<OwnedReadHalf>, MessageWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (MessageReader::new(read), MessageWriter::new(write))
}

/// Connect to `addr`, retrying until the configured timeout.
pub async fn connect_with_retry(addr: SocketAddr, config: &TransportConfig) -> CadenceResult<TcpStream> {
    let deadline = tokio::time::Instant::now() + config.connect_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%addr, attempts, "connected");
                return Ok(stream);
            }
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(CadenceError::Timeout(format!(
                        "connecting to {} after {} attempts: {}",
                        addr, attempts, e
                    )));
                }
                tracing::debug!(%addr, error = %e, "connect failed, retrying");
            }
        }
        // Jitter keeps federates started together from retrying in lockstep
        let jitter_ms = rand::thread_rng().gen_range(0..=config.connect_retry_interval.as_millis() as u64 / 10);
        let pause = config.connect_retry_interval + Duration::from_millis(jitter_ms);
        tokio::time::sleep_until((tokio::time::Instant::now() + pause).min(deadline)).await;
    }
}

/// Bind a listener on `addr`, retrying while the port is busy.
///
/// Port 0 picks any free port and is never retried.
pub async fn bind_with_retry(addr: SocketAddr, config: &TransportConfig) -> CadenceResult<TcpListener> {
    let mut attempt = 0u32;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if addr.port() != 0 && attempt < config.bind_retry_attempts => {
                attempt += 1;
                tracing::warn!(%addr, error = %e, attempt, "bind failed, retrying");
                tokio::time::sleep(config.bind_retry_interval).await;
            }
            Err(e) => return Err(CadenceError::fatal(format!("binding {}", addr), e)),
        }
    }
}

//! Newline-delimited JSON over a byte stream
//!
//! Used for TCP connections and for stdio. One JSON value per line.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    Stdin, Stdout,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use super::{Transport, TransportError};

/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const SEPARATOR: &[u8] = b"\n";

/// Line-framed transport over any async reader/writer pair
pub struct StreamTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
    closed: AtomicBool,
    max_frame_bytes: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::from_buffered(BufReader::new(reader), writer)
    }

    /// Reuse a reader that already has buffered input (e.g. stdin after
    /// the secret handshake consumed its first lines)
    pub fn from_buffered(reader: BufReader<R>, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }
}

/// Drop input up to and including the next newline. False if the input
/// ended first.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<bool> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(at) => {
                reader.consume(at + 1);
                return Ok(true);
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Transport over an accepted TCP connection
pub fn tcp(stream: TcpStream) -> StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    let (reader, writer) = stream.into_split();
    StreamTransport::new(reader, writer)
}

/// Transport over the process' own stdin/stdout
pub fn stdio(stdin: BufReader<Stdin>) -> StreamTransport<Stdin, Stdout> {
    StreamTransport::from_buffered(stdin, tokio::io::stdout())
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut reader = self.reader.lock().await;
        let limit = self.max_frame_bytes;

        loop {
            let mut frame = Vec::new();
            // One byte of slack so a full-size frame can still carry its separator
            let read = (&mut *reader)
                .take(limit as u64 + 1)
                .read_until(b'\n', &mut frame)
                .await?;
            if read == 0 {
                return Ok(None);
            }

            if frame.last() == Some(&b'\n') {
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
            } else if frame.len() > limit {
                warn!("Skipping frame larger than {} bytes", limit);
                if !discard_line(&mut *reader).await? {
                    return Ok(None);
                }
                continue;
            }

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.write_all(SEPARATOR).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

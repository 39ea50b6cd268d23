//! Framed I/O over a TCP stream.
//!
//! Reads are single-consumer by construction (one read loop per
//! connection owns the [`FrameReader`]).  Writes can come from many tasks
//! — the router, heartbeat sweeps, the reminder worker — so [`FrameWriter`]
//! serializes them behind a mutex; a frame is always written whole.

use cm_protocol::{Frame, FrameError, FrameParser, Packet};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

/// Clone-able handle to the write half of a connection.  Holding the inner
/// lock for the duration of one `write_all` keeps concurrent writers from
/// interleaving frame bytes.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        FrameWriter {
            inner: Arc::new(Mutex::new(write_half)),
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), WireError> {
        let bytes = packet.encode();
        let mut half = self.inner.lock().await;
        half.write_all(&bytes).await?;
        Ok(())
    }

    /// Half-close the connection.  Errors are ignored: the socket may
    /// already be gone, and teardown proceeds either way.
    pub async fn shutdown(&self) {
        let mut half = self.inner.lock().await;
        let _ = half.shutdown().await;
    }

    /// Whether two handles refer to the same underlying connection.  Used
    /// by the registries to make teardown idempotent across session
    /// generations.
    pub fn same_connection(&self, other: &FrameWriter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// The read half of a connection plus the streaming parser state.
pub struct FrameReader {
    read_half: OwnedReadHalf,
    parser: FrameParser,
    buf: [u8; READ_CHUNK],
}

impl FrameReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        FrameReader {
            read_half,
            parser: FrameParser::new(),
            buf: [0u8; READ_CHUNK],
        }
    }

    /// Next complete frame from the stream.
    ///
    /// `Ok(None)` signals clean EOF.  A malformed frame surfaces as
    /// `WireError::Frame`; the caller must close the connection.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        loop {
            if let Some(frame) = self.parser.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.read_half.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&self.buf[..n]);
        }
    }
}

/// Split a stream into the reader/writer pair used by every session loop.
pub fn split(stream: tokio::net::TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

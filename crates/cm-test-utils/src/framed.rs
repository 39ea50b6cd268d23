//! A framed TCP endpoint for tests: blocking-style sends and receives with
//! a timeout on every read, so a misbehaving node fails the test instead
//! of hanging it.

use cm_protocol::{Frame, FrameParser, Packet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FramedStream {
    stream: TcpStream,
    parser: FrameParser,
}

impl FramedStream {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(FramedStream {
            stream,
            parser: FrameParser::new(),
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        self.stream.write_all(&packet.encode()).await
    }

    /// Write arbitrary bytes, for malformed-input tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Next frame within [`RECV_TIMEOUT`]; `Ok(None)` on clean EOF.
    pub async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        self.recv_frame_within(RECV_TIMEOUT).await
    }

    pub async fn recv_frame_within(&mut self, limit: Duration) -> io::Result<Option<Frame>> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self
                .parser
                .next_frame()
                .map_err(|e| io::Error::other(format!("malformed frame from node: {e}")))?
            {
                return Ok(Some(frame));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let n = timeout(remaining, self.stream.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no frame in time"))??;
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&buf[..n]);
        }
    }

    /// Next decodable packet, or an error on EOF/timeout.
    pub async fn recv(&mut self) -> io::Result<Packet> {
        match self.recv_frame().await? {
            Some(frame) => Packet::decode(&frame)
                .map_err(|e| io::Error::other(format!("undecodable packet: {e}"))),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
        }
    }

    /// Like [`recv`](Self::recv), but heartbeat `PING`s are answered with
    /// `PONG` and skipped, since sweeps interleave them freely.
    pub async fn recv_non_ping(&mut self) -> io::Result<Packet> {
        loop {
            match self.recv().await? {
                Packet::Ping => self.send(&Packet::Pong).await?,
                other => return Ok(other),
            }
        }
    }

    /// True when the node has closed the connection (EOF within the
    /// timeout window).
    pub async fn closed_by_remote(&mut self) -> io::Result<bool> {
        Ok(self.recv_frame().await?.is_none())
    }
}

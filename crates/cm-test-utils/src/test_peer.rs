//! A fake peer server for tests: performs the `CONNECT_SERVER` handshake
//! and then behaves like any mesh link, so federation flows can be tested
//! against a single real node.

use crate::framed::FramedStream;
use cm_protocol::{ConnectResult, ConnectServer, Connected, Packet, features};
use std::io;
use std::net::SocketAddr;

pub struct TestPeer {
    stream: FramedStream,
    pub server_id: String,
}

impl TestPeer {
    /// Dial the node and perform the peer handshake, returning the node's
    /// verdict.
    pub async fn handshake(
        addr: SocketAddr,
        server_id: &str,
    ) -> io::Result<(Self, ConnectResult)> {
        let mut stream = FramedStream::connect(addr).await?;
        stream
            .send(&Packet::ConnectServer(ConnectServer {
                server_id: server_id.to_owned(),
                features: vec![
                    features::MESSAGES.to_owned(),
                    features::TRANSLATION.to_owned(),
                    features::REMINDER.to_owned(),
                ],
            }))
            .await?;
        // Heartbeat pings can race the handshake reply; skip them.
        let result = loop {
            match stream.recv().await? {
                Packet::Connected(Connected { result }) => break result,
                Packet::Ping | Packet::Pong => {}
                other => {
                    return Err(io::Error::other(format!(
                        "expected CONNECTED, got {other:?}"
                    )));
                }
            }
        };
        Ok((
            TestPeer {
                stream,
                server_id: server_id.to_owned(),
            },
            result,
        ))
    }

    /// Handshake and require acceptance.
    pub async fn connect_accepted(addr: SocketAddr, server_id: &str) -> io::Result<Self> {
        let (peer, result) = Self::handshake(addr, server_id).await?;
        if result != ConnectResult::Connected {
            return Err(io::Error::other(format!(
                "node rejected peer {server_id}: {result:?}"
            )));
        }
        Ok(peer)
    }

    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        self.stream.send(packet).await
    }

    pub async fn recv(&mut self) -> io::Result<Packet> {
        self.stream.recv().await
    }

    pub async fn recv_non_ping(&mut self) -> io::Result<Packet> {
        self.stream.recv_non_ping().await
    }

    pub async fn closed_by_remote(&mut self) -> io::Result<bool> {
        self.stream.closed_by_remote().await
    }
}

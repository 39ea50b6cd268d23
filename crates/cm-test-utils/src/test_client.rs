//! A chat client for tests: performs the `CONNECT_CLIENT` handshake and
//! exchanges packets with the node under test.

use crate::framed::FramedStream;
use cm_protocol::{ConnectClient, ConnectResult, Connected, Packet, UserRef};
use std::io;
use std::net::SocketAddr;

pub struct TestClient {
    stream: FramedStream,
    pub user: UserRef,
}

impl TestClient {
    /// Connect and identify as `user_id@server_id`, returning the node's
    /// verdict alongside the (possibly already rejected) client.
    pub async fn connect_as(
        addr: SocketAddr,
        user_id: &str,
        server_id: &str,
    ) -> io::Result<(Self, ConnectResult)> {
        let user = UserRef::new(user_id, server_id);
        let mut stream = FramedStream::connect(addr).await?;
        stream
            .send(&Packet::ConnectClient(ConnectClient { user: user.clone() }))
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
        Ok((TestClient { stream, user }, result))
    }

    /// Connect and require acceptance.
    pub async fn connect_accepted(
        addr: SocketAddr,
        user_id: &str,
        server_id: &str,
    ) -> io::Result<Self> {
        let (client, result) = Self::connect_as(addr, user_id, server_id).await?;
        if result != ConnectResult::Connected {
            return Err(io::Error::other(format!(
                "node rejected {user_id}: {result:?}"
            )));
        }
        Ok(client)
    }

    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        self.stream.send(packet).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.send_raw(bytes).await
    }

    pub async fn recv(&mut self) -> io::Result<Packet> {
        self.stream.recv().await
    }

    /// Next packet that is not heartbeat traffic.
    pub async fn recv_non_ping(&mut self) -> io::Result<Packet> {
        self.stream.recv_non_ping().await
    }

    pub async fn closed_by_remote(&mut self) -> io::Result<bool> {
        self.stream.closed_by_remote().await
    }
}

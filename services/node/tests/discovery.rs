//! UDP discovery: probe answering and the announce→dial→mesh handshake.

use cm_protocol::{
    ChatMessage, ConnectResult, Connected, Content, Packet, Recipient, ServerAnnounce, UserRef,
    decode_datagram, features,
};
use cm_test_utils::TestClient;
use node::{Node, NodeConfig};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

async fn start_node(server_id: &str) -> Node {
    let mut config = NodeConfig::with_server_id(server_id);
    config.network.tcp_port = 0;
    config.network.udp_port = 0;
    // Keep the announce broadcast away from real ports; the discard port
    // is never answered.
    config.network.peer_ports = vec![9];
    config.mesh.dial_backoff_min = Duration::from_millis(10);
    config.mesh.dial_backoff_max = Duration::from_millis(50);
    Node::start(config).await.expect("node start")
}

#[tokio::test]
async fn discover_probe_gets_a_unicast_announce() {
    let node = start_node("S1").await;

    let probe_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let target = ("127.0.0.1", node.udp_addr().port());
    probe_socket
        .send_to(&Packet::DiscoverServer.encode(), target)
        .await
        .expect("send probe");

    let mut buf = [0u8; 2048];
    let (len, _from) = timeout(Duration::from_secs(5), probe_socket.recv_from(&mut buf))
        .await
        .expect("announce in time")
        .expect("recv");

    let frame = decode_datagram(&buf[..len]).expect("one frame per datagram");
    match Packet::decode(&frame).expect("decode") {
        Packet::ServerAnnounce(announce) => {
            assert_eq!(announce.server_id, "S1");
            let names: Vec<&str> = announce.features.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(
                names,
                vec![features::MESSAGES, features::TRANSLATION, features::REMINDER]
            );
        }
        other => panic!("expected SERVER_ANNOUNCE, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn announce_triggers_an_outbound_dial_with_handshake() {
    let node = start_node("S1").await;

    // Play the part of server S9: a TCP listener awaiting the dial.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let tcp_port = listener.local_addr().expect("addr").port();

    let announcer = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let announce = Packet::ServerAnnounce(ServerAnnounce {
        server_id: "S9".to_owned(),
        features: vec![cm_protocol::Feature {
            name: features::MESSAGES.to_owned(),
            port: tcp_port,
        }],
    });
    announcer
        .send_to(&announce.encode(), ("127.0.0.1", node.udp_addr().port()))
        .await
        .expect("send announce");

    // The node dials us after its back-off and opens with CONNECT_SERVER.
    let (stream, _addr) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("dial in time")
        .expect("accept");

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = stream;
    let mut parser = cm_protocol::FrameParser::new();
    let hello = loop {
        if let Some(frame) = parser.next_frame().expect("well-formed") {
            break frame;
        }
        let mut buf = [0u8; 1024];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("hello in time")
            .expect("read");
        assert!(n > 0, "node closed before the handshake");
        parser.feed(&buf[..n]);
    };
    match Packet::decode(&hello).expect("decode") {
        Packet::ConnectServer(connect) => {
            assert_eq!(connect.server_id, "S1");
            assert!(connect.features.contains(&features::MESSAGES.to_owned()));
        }
        other => panic!("expected CONNECT_SERVER, got {other:?}"),
    }

    // Accept the peering; from here the link is a live mesh link.
    let reply = Packet::Connected(Connected {
        result: ConnectResult::Connected,
    });
    stream.write_all(&reply.encode()).await.expect("write");

    // Prove it: a client message addressed to x@S9 arrives on this link.
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect client");
    // The peer registration races the CONNECTED reply we just sent.
    let mut routed = None;
    for _ in 0..50 {
        if node.state().has_peer("S9").await {
            routed = Some(());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(routed.is_some(), "peer session must be installed after handshake");

    let sent = Packet::Message(ChatMessage {
        snowflake: 5,
        author: alice.user.clone(),
        recipient: Recipient::User(UserRef::new("x", "S9")),
        content: Content::Text("hello S9".to_owned()),
    });
    alice.send(&sent).await.expect("send");

    let forwarded = loop {
        if let Some(frame) = parser.next_frame().expect("well-formed") {
            match Packet::decode(&frame).expect("decode") {
                Packet::Ping => continue,
                packet => break packet,
            }
        }
        let mut buf = [0u8; 4096];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("forward in time")
            .expect("read");
        assert!(n > 0, "link closed unexpectedly");
        parser.feed(&buf[..n]);
    };
    assert_eq!(forwarded, sent);

    node.shutdown().await;
}

#[tokio::test]
async fn operator_probe_reaches_peer_ports() {
    // A second socket stands in for another server's discovery port; the
    // node's probe must arrive there as a DISCOVER_SERVER frame.
    let other = UdpSocket::bind(("0.0.0.0", 0)).await.expect("bind");
    let other_port = other.local_addr().expect("addr").port();

    let mut config = NodeConfig::with_server_id("S1");
    config.network.tcp_port = 0;
    config.network.udp_port = 0;
    config.network.peer_ports = vec![other_port];
    config.mesh.dial_backoff_min = Duration::from_millis(10);
    config.mesh.dial_backoff_max = Duration::from_millis(50);
    let node = Node::start(config).await.expect("node start");

    node.discover().await;

    let mut buf = [0u8; 2048];
    let received = timeout(Duration::from_secs(5), other.recv_from(&mut buf)).await;
    // Limited broadcast may be filtered in constrained environments; when
    // it is deliverable, the frame must be a lone DISCOVER_SERVER.
    if let Ok(Ok((len, _from))) = received {
        let frame = decode_datagram(&buf[..len]).expect("one frame per datagram");
        assert_eq!(
            Packet::decode(&frame).expect("decode"),
            Packet::DiscoverServer
        );
    }

    node.shutdown().await;
}

//! Reminder scheduling through the client protocol: precise firing,
//! earlier-insertion preemption, the self-only authority rule, and the
//! offline drop.

use cm_protocol::{Packet, Reminder, SetReminder, UserRef};
use cm_test_utils::TestClient;
use node::{Node, NodeConfig};
use std::time::Duration;
use tokio::time::Instant;

async fn start_node(server_id: &str) -> Node {
    let mut config = NodeConfig::with_server_id(server_id);
    config.network.tcp_port = 0;
    config.network.udp_port = 0;
    Node::start(config).await.expect("node start")
}

fn set_reminder(user: &UserRef, event: &str, countdown_seconds: u64) -> Packet {
    Packet::SetReminder(SetReminder {
        user: user.clone(),
        event: event.to_owned(),
        countdown_seconds,
    })
}

async fn expect_reminder(client: &mut TestClient) -> Reminder {
    match client.recv_non_ping().await.expect("recv") {
        Packet::Reminder(reminder) => reminder,
        other => panic!("expected REMINDER, got {other:?}"),
    }
}

#[tokio::test]
async fn reminder_fires_at_its_time_not_before() {
    let node = start_node("S1").await;
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect");

    let started = Instant::now();
    let user = alice.user.clone();
    alice
        .send(&set_reminder(&user, "lunch", 1))
        .await
        .expect("send");

    let reminder = expect_reminder(&mut alice).await;
    let elapsed = started.elapsed();

    assert_eq!(reminder.content, "lunch");
    assert_eq!(reminder.user, UserRef::new("a", "S1"));
    assert!(
        elapsed >= Duration::from_millis(900),
        "reminder fired early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(4),
        "reminder fired far too late: {elapsed:?}"
    );

    node.shutdown().await;
}

#[tokio::test]
async fn later_insertion_with_earlier_fire_time_preempts_the_head() {
    let node = start_node("S1").await;
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect");

    // Schedule the far one first; the near one must still fire first, which
    // means the worker's sleep was interrupted and recomputed.
    let user = alice.user.clone();
    alice.send(&set_reminder(&user, "far", 3)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.send(&set_reminder(&user, "near", 1)).await.expect("send");

    let first = expect_reminder(&mut alice).await;
    assert_eq!(first.content, "near");
    let second = expect_reminder(&mut alice).await;
    assert_eq!(second.content, "far");

    node.shutdown().await;
}

#[tokio::test]
async fn reminder_for_another_user_is_rejected() {
    let node = start_node("S1").await;
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect a");
    let mut bob = TestClient::connect_accepted(node.tcp_addr(), "b", "S1")
        .await
        .expect("connect b");

    // Alice tries to remind Bob: rejected, nothing is scheduled.
    alice
        .send(&set_reminder(&UserRef::new("b", "S1"), "gotcha", 1))
        .await
        .expect("send");

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(node.state().reminders.is_empty(), "nothing may be scheduled");

    // Bob saw no reminder; both sessions still live.
    bob.send(&Packet::Ping).await.expect("ping");
    assert_eq!(bob.recv_non_ping().await.expect("recv"), Packet::Pong);
    alice.send(&Packet::Ping).await.expect("ping");
    assert_eq!(alice.recv_non_ping().await.expect("recv"), Packet::Pong);

    node.shutdown().await;
}

#[tokio::test]
async fn reminder_for_offline_user_is_dropped() {
    let node = start_node("S1").await;

    // Scheduled through the internal API, as the scheduling server would
    // after its client disconnected.
    node.schedule_reminder("ghost", "nobody home", Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(node.state().reminders.is_empty(), "entry is consumed on fire");

    // Node is unaffected.
    let mut probe = TestClient::connect_accepted(node.tcp_addr(), "x", "S1")
        .await
        .expect("connect");
    probe.send(&Packet::Ping).await.expect("ping");
    assert_eq!(probe.recv_non_ping().await.expect("recv"), Packet::Pong);

    node.shutdown().await;
}

#[tokio::test]
async fn two_reminders_fire_in_time_order() {
    let node = start_node("S1").await;
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect");

    let user = alice.user.clone();
    alice.send(&set_reminder(&user, "second", 2)).await.expect("send");
    alice.send(&set_reminder(&user, "first", 1)).await.expect("send");

    assert_eq!(expect_reminder(&mut alice).await.content, "first");
    assert_eq!(expect_reminder(&mut alice).await.content, "second");

    node.shutdown().await;
}

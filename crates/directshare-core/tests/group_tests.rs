//! Integration tests for group formation and transfers over the group
//! connection, using loopback sockets.

mod common;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use directshare_core::connection::GroupConnection;
use directshare_core::events::ConnectionStatus;
use directshare_core::group::{GroupRole, NodeState};
use directshare_core::node::Node;
use directshare_core::Error;

use common::{assert_files_equal, create_temp_dir, create_test_file, loopback_node, random_bytes, wait_until};

fn record_status(node: &Node) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.events()
        .on_connection_status(move |status| sink.lock().unwrap().push(status.clone()));
    seen
}

fn record_connections(node: &Node) -> Arc<Mutex<Vec<GroupConnection>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.events()
        .on_connection_established(move |connection| sink.lock().unwrap().push(connection.clone()));
    seen
}

fn owner_address(owner: &Node) -> String {
    let port = owner.listen_addr().expect("owner listening").port();
    format!("127.0.0.1:{port}")
}

async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_join_dead_address_fails_cleanly() {
    let node = loopback_node("lonely", Ipv4Addr::new(10, 88, 0, 1));
    let statuses = record_status(&node);
    node.start().await.expect("start");

    let dead = format!("127.0.0.1:{}", unused_port().await);
    let err = node.join_group(&dead).await.unwrap_err();

    assert!(matches!(err, Error::HandshakeFailed(_)), "got {err:?}");
    {
        let seen = statuses.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].connected);
        assert!(seen[0].detail.starts_with("Failed to connect"));
    }

    // Loops keep running after the failure.
    assert!(node.is_discovering());
    assert!(node.listen_addr().is_some());
    assert!(!node.is_connected());
    assert_eq!(node.state(), NodeState::Discovering);
    assert_eq!(node.role(), GroupRole::None);

    node.stop().await;
}

#[tokio::test]
async fn test_join_and_transfer_over_group() {
    let owner = loopback_node("owner", Ipv4Addr::new(10, 88, 1, 1));
    let joiner = loopback_node("joiner", Ipv4Addr::new(10, 88, 1, 2));
    let owner_status = record_status(&owner);
    let joiner_status = record_status(&joiner);
    let owner_connections = record_connections(&owner);

    owner.start().await.expect("owner start");
    joiner.start().await.expect("joiner start");

    owner.create_group().await.expect("create group");
    assert_eq!(owner.role(), GroupRole::Owner);
    assert_eq!(owner.state(), NodeState::OwnerWaiting);

    let connection = joiner.join_group(&owner_address(&owner)).await.expect("join");
    assert_eq!(connection.peer_addr().ip().to_string(), "127.0.0.1");
    assert!(joiner.is_connected());
    assert_eq!(joiner.role(), GroupRole::Joiner);
    assert_eq!(joiner.state(), NodeState::Connected);

    assert!(wait_until(Duration::from_secs(5), || owner.is_connected()).await);
    assert_eq!(owner.state(), NodeState::Connected);
    assert_eq!(owner_connections.lock().unwrap().len(), 1);
    assert_eq!(owner_connections.lock().unwrap()[0].peer_name(), "joiner");
    // The owner reports the address the joiner advertised in its handshake.
    assert!(
        wait_until(Duration::from_secs(5), || owner_status
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.connected && s.detail == "10.88.1.2"))
        .await
    );
    assert!(joiner_status
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.connected && s.detail == "127.0.0.1"));

    let src = create_temp_dir();
    let dst = create_temp_dir();
    let path = create_test_file(src.path(), "notes.md", &random_bytes(700_000));

    let (sent, received) = tokio::join!(joiner.send_file(&path), owner.receive_file_into(dst.path()));
    let sent = sent.expect("send");
    let received = received.expect("receive");
    assert!(sent.success && received.success);
    assert_files_equal(&path, &dst.path().join("notes.md"));

    // And the other way round, through the pool.
    let back = create_test_file(src.path(), "reply.txt", b"got it, thanks");
    let send_task = owner.send_file_async(back.clone()).expect("queue send");
    let recv_task = joiner.receive_file_async(dst.path()).expect("queue receive");
    let (sent, received) = tokio::join!(send_task.join(), recv_task.join());
    assert!(sent.success, "{:?}", sent.error_message);
    assert!(received.success, "{:?}", received.error_message);
    assert_files_equal(&back, &dst.path().join("reply.txt"));

    assert_eq!(owner.statistics().total_files_transferred, 2);
    assert_eq!(joiner.statistics().total_files_transferred, 2);

    joiner.stop().await;
    owner.stop().await;
    assert_eq!(owner.state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_new_joiner_replaces_and_closes_previous_connection() {
    let owner = loopback_node("owner", Ipv4Addr::new(10, 88, 2, 1));
    let first = loopback_node("first", Ipv4Addr::new(10, 88, 2, 2));
    let second = loopback_node("second", Ipv4Addr::new(10, 88, 2, 3));
    let owner_connections = record_connections(&owner);

    for node in [&owner, &first, &second] {
        node.start().await.expect("start");
    }
    owner.create_group().await.expect("create group");

    first.join_group(&owner_address(&owner)).await.expect("first join");
    assert!(wait_until(Duration::from_secs(5), || owner_connections.lock().unwrap().len() == 1).await);

    second.join_group(&owner_address(&owner)).await.expect("second join");
    assert!(wait_until(Duration::from_secs(5), || owner_connections.lock().unwrap().len() == 2).await);

    let (old, new) = {
        let seen = owner_connections.lock().unwrap();
        (seen[0].clone(), seen[1].clone())
    };
    assert!(wait_until(Duration::from_secs(5), || old.is_closed()).await);
    assert!(!new.is_closed());
    assert_eq!(new.peer_name(), "second");
    assert!(owner.group_connection().unwrap().same_as(&new));

    for node in [&second, &first, &owner] {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_malformed_handshake_is_dropped() {
    let owner = loopback_node("owner", Ipv4Addr::new(10, 88, 3, 1));
    let joiner = loopback_node("joiner", Ipv4Addr::new(10, 88, 3, 2));
    owner.start().await.expect("owner start");
    joiner.start().await.expect("joiner start");

    let mut rogue = TcpStream::connect(owner.listen_addr().unwrap()).await.unwrap();
    rogue.write_all(b"HELLO THERE").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!owner.is_connected());

    // The accept loop survives and still takes a proper joiner.
    joiner.join_group(&owner_address(&owner)).await.expect("join");
    assert!(wait_until(Duration::from_secs(5), || owner.is_connected()).await);

    joiner.stop().await;
    owner.stop().await;
}

#[tokio::test]
async fn test_group_operations_require_start() {
    let node = loopback_node("idle", Ipv4Addr::new(10, 88, 4, 1));

    assert!(matches!(node.create_group().await, Err(Error::NotRunning(_))));
    assert!(matches!(
        node.join_group("127.0.0.1").await,
        Err(Error::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_leave_group_closes_connection() {
    let owner = loopback_node("owner", Ipv4Addr::new(10, 88, 5, 1));
    let joiner = loopback_node("joiner", Ipv4Addr::new(10, 88, 5, 2));
    let joiner_status = record_status(&joiner);
    owner.start().await.expect("owner start");
    joiner.start().await.expect("joiner start");

    let connection = joiner.join_group(&owner_address(&owner)).await.expect("join");
    joiner.leave_group().await;

    assert!(connection.is_closed());
    assert!(!joiner.is_connected());
    assert_eq!(joiner.state(), NodeState::Discovering);
    assert!(matches!(joiner.send_file("anything").await, Err(Error::NotConnected)));
    assert!(joiner_status
        .lock()
        .unwrap()
        .last()
        .is_some_and(|s| !s.connected));

    joiner.stop().await;
    owner.stop().await;
}

#[tokio::test]
async fn test_handshake_arriving_after_stop_is_dropped() {
    let owner = loopback_node("owner", Ipv4Addr::new(10, 88, 6, 1));
    let established = record_connections(&owner);
    owner.start().await.expect("start");

    let mut late = TcpStream::connect(owner.listen_addr().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    owner.stop().await;

    // The socket may already be reset; either way nothing may be installed.
    let _ = late.write_all(b"JOIN:late:10.9.9.2").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(owner.state(), NodeState::Stopped);
    assert_eq!(owner.role(), GroupRole::None);
    assert!(!owner.is_connected());
    assert!(owner.group_connection().is_none());
    assert!(established.lock().unwrap().is_empty());
}

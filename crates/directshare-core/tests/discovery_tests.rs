//! Integration tests for peer discovery.

mod common;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use directshare_core::config::NetworkConfig;
use directshare_core::discovery::{DiscoveryService, LocalDevice};
use directshare_core::events::{Event, EventBus};
use directshare_core::peer::PeerRegistry;
use directshare_core::Error;

use common::{get_test_ports, loopback_config, loopback_node, wait_until};

fn counting_bus() -> (Arc<EventBus>, Arc<AtomicUsize>) {
    let events = Arc::new(EventBus::new());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    events.on_peer_discovered(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (events, count)
}

#[tokio::test]
async fn test_announcements_over_loopback() {
    let node = loopback_node("listener", Ipv4Addr::new(10, 77, 0, 1));
    let discovered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&discovered);
    node.events().on_peer_discovered(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut feed = node.events().subscribe();

    node.start().await.expect("start");

    let port = node.config().network.discovery_port;
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        sender
            .send_to(b"DISCOVER:WiFiDirectFileShare:remote:10.77.0.2", ("127.0.0.1", port))
            .await
            .unwrap();
    }
    sender
        .send_to(b"not a discovery datagram", ("127.0.0.1", port))
        .await
        .unwrap();

    let found = wait_until(Duration::from_secs(5), || node.peers().len() == 1).await;
    assert!(found, "peer never discovered");

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Event::PeerDiscovered(peer)) = feed.recv().await {
                return peer;
            }
        }
    })
    .await
    .expect("discovery event");
    assert_eq!(event.name, "remote");
    assert_eq!(event.address, "10.77.0.2");

    // Our own announcements loop back to us and must be ignored.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let peers = node.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, "10.77.0.2");
    assert_eq!(discovered.load(Ordering::SeqCst), 1);

    node.stop().await;
    assert!(!node.is_discovering());
}

#[test]
fn test_simultaneous_announcements_yield_one_entry_each() {
    let (events, discovered) = counting_bus();
    let registry = Arc::new(PeerRegistry::new());
    let service = Arc::new(DiscoveryService::new(
        NetworkConfig::default(),
        LocalDevice::new("me", Ipv4Addr::new(192, 168, 0, 1)),
        Arc::clone(&registry),
        events,
    ));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                let datagram = if i % 2 == 0 {
                    "DISCOVER:WiFiDirectFileShare:alpha:192.168.0.10"
                } else {
                    "DISCOVER:WiFiDirectFileShare:beta:192.168.0.11"
                };
                service.handle_datagram(datagram.as_bytes()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.len(), 2);
    assert_eq!(discovered.load(Ordering::SeqCst), 2);
    assert_eq!(registry.get("192.168.0.10").unwrap().name, "alpha");
    assert_eq!(registry.get("192.168.0.11").unwrap().name, "beta");
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restartable() {
    let config = loopback_config("restart");
    let (events, _) = counting_bus();
    let service = DiscoveryService::new(
        config.network,
        LocalDevice::new("restart", Ipv4Addr::new(10, 77, 1, 1)),
        Arc::new(PeerRegistry::new()),
        events,
    );

    service.start().expect("first start");
    service.start().expect("second start is a no-op");
    assert!(service.is_running());
    service.announce().await.expect("announce");
    service.broadcast_group_created().await.expect("group created");

    service.stop().await;
    service.stop().await;
    assert!(!service.is_running());
    assert!(matches!(service.announce().await, Err(Error::NotRunning(_))));

    service.start().expect("restart rebinds the port");
    assert!(service.is_running());
    service.stop().await;
}

#[tokio::test]
async fn test_port_in_use_is_bind_error() {
    let (discovery_port, _) = get_test_ports();
    let _occupier = std::net::UdpSocket::bind(("0.0.0.0", discovery_port)).unwrap();

    let config = NetworkConfig {
        discovery_port,
        ..NetworkConfig::default()
    };
    let (events, _) = counting_bus();
    let service = DiscoveryService::new(
        config,
        LocalDevice::new("late", Ipv4Addr::new(10, 77, 2, 1)),
        Arc::new(PeerRegistry::new()),
        events,
    );

    let err = service.start().unwrap_err();
    assert!(matches!(err, Error::Bind { what: "discovery socket", .. }));
    assert!(!service.is_running());
}

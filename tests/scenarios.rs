//! End-to-end fault scenarios over loopback with the seeded simulator.
//!
//! Every test keeps the server-side connection open until the client has
//! finished closing, so a retransmitted FIN always finds someone to answer it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rdt_transport::{
    packet::PacketKind,
    simulator::{Simulator, SimulatorConfig},
    socket::Socket,
    state::Lifecycle,
    Connection, Listener, RdtConfig, Shutdown,
};

fn fast_config() -> RdtConfig {
    RdtConfig::default().with_resend_time(Duration::from_millis(40))
}

async fn ephemeral() -> Socket {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

/// Read until end of stream, returning everything received.
async fn read_all(conn: &Connection) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    loop {
        let data = conn.recv().await.expect("recv");
        if data.is_empty() {
            return received;
        }
        received.push(data);
    }
}

/// Three 100-byte messages, window of two, 20% loss on every datagram in
/// both directions: all three arrive, in order, exactly once.
#[tokio::test]
async fn lossy_link_window_two() {
    let config = fast_config().with_window_size(2);

    let server_sim = Arc::new(Simulator::new(SimulatorConfig::lossy(0.2, 11)));
    let listener = Listener::from_socket(ephemeral().await.with_simulator(Arc::clone(&server_sim)), config.clone());
    listener.listen(1);

    let client_sim = Arc::new(Simulator::new(SimulatorConfig::lossy(0.2, 7)));
    let client = Connection::connect_on(
        ephemeral().await.with_simulator(Arc::clone(&client_sim)),
        listener.local_addr(),
        config,
    )
    .await
    .expect("connect");
    let (server, _) = listener.accept().await.expect("accept");

    let reader = tokio::spawn(async move {
        let received = read_all(&server).await;
        (server, received)
    });

    let messages: Vec<Vec<u8>> = (0..3u8).map(|i| vec![b'a' + i; 100]).collect();
    for msg in &messages {
        assert_eq!(client.send(msg).await.unwrap(), 100);
    }
    let outcome = tokio::time::timeout(Duration::from_secs(10), client.close_sender())
        .await
        .expect("close_sender hung");
    assert_eq!(outcome, Shutdown::Graceful);

    let (server, received) = reader.await.unwrap();
    assert_eq!(received, messages);
    server.close_receiver().await;
}

/// Duplicated and delayed (hence reordered) datagrams never break ordering
/// or cause double delivery.
#[tokio::test]
async fn duplication_and_reordering() {
    const MSG_COUNT: usize = 30;
    let faults = |seed| SimulatorConfig {
        duplicate_rate: 0.2,
        delay_rate: 0.2,
        delay: Duration::from_millis(15),
        seed,
        ..SimulatorConfig::default()
    };

    let listener = Listener::from_socket(
        ephemeral().await.with_simulator(Arc::new(Simulator::new(faults(1)))),
        fast_config(),
    );
    listener.listen(1);
    let client = Connection::connect_on(
        ephemeral().await.with_simulator(Arc::new(Simulator::new(faults(2)))),
        listener.local_addr(),
        fast_config(),
    )
    .await
    .unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let reader = tokio::spawn(async move {
        let received = read_all(&server).await;
        (server, received)
    });

    let messages: Vec<Vec<u8>> = (0..MSG_COUNT).map(|i| format!("#{i}").into_bytes()).collect();
    for msg in &messages {
        client.send(msg).await.unwrap();
    }
    assert_eq!(client.close_sender().await, Shutdown::Graceful);

    let (server, received) = reader.await.unwrap();
    assert_eq!(received, messages);
    server.close_receiver().await;
}

/// With a backlog of one, a second client's SYNs are dropped until the first
/// connection is accepted; its retries then get through.
#[tokio::test]
async fn backlog_of_one_defers_second_client() {
    let listener = Listener::from_socket(ephemeral().await, fast_config());
    listener.listen(1);
    let addr = listener.local_addr();

    let first = Connection::connect(addr, fast_config()).await.expect("first connect");
    assert_eq!(listener.pending(), 1);

    let second = tokio::spawn(async move { Connection::connect(addr, fast_config()).await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(listener.pending(), 1, "SYN beyond the backlog must be dropped");
    assert!(!second.is_finished(), "second client must still be retrying");

    let (_first_server, first_peer) = listener.accept().await.unwrap();
    assert_eq!(first_peer.port(), first.local_addr().port());

    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second connect hung")
        .unwrap()
        .expect("second connect failed");
    let (_second_server, second_peer) = listener.accept().await.unwrap();
    assert_eq!(second_peer.port(), second.local_addr().port());
    assert_eq!(listener.established(), 2);
}

/// The first three FINs are lost; the fourth gets its FIN-ACK and the close
/// still counts as graceful.
#[tokio::test]
async fn lost_fins_still_close_gracefully() {
    let listener = Listener::from_socket(ephemeral().await, fast_config());
    listener.listen(1);

    let client_sim = Arc::new(Simulator::passthrough());
    let client = Connection::connect_on(
        ephemeral().await.with_simulator(Arc::clone(&client_sim)),
        listener.local_addr(),
        fast_config(),
    )
    .await
    .unwrap();
    let (server, _) = listener.accept().await.unwrap();

    client.send(b"last words").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"last words");

    client_sim.drop_next(PacketKind::Fin, 3);
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.close_sender())
        .await
        .expect("close_sender hung");

    assert_eq!(outcome, Shutdown::Graceful);
    assert_eq!(client_sim.stats().dropped, 3);
    assert!(server.recv().await.unwrap().is_empty());
    assert_eq!(server.lifecycle(), Lifecycle::PeerClosed);
    server.close_receiver().await;
}

/// A data packet corrupted in flight is never handed to the application; the
/// retransmitted copy is delivered exactly once.
#[tokio::test]
async fn corrupted_packet_is_retransmitted_not_delivered() {
    let listener = Listener::from_socket(ephemeral().await, fast_config());
    listener.listen(1);

    let client_sim = Arc::new(Simulator::passthrough());
    client_sim.corrupt_next(PacketKind::Data, 1);
    let client = Connection::connect_on(
        ephemeral().await.with_simulator(Arc::clone(&client_sim)),
        listener.local_addr(),
        fast_config(),
    )
    .await
    .unwrap();
    let (server, _) = listener.accept().await.unwrap();

    let reader = tokio::spawn(async move {
        let received = read_all(&server).await;
        (server, received)
    });

    client.send(b"fragile payload").await.unwrap();
    client.send(b"second").await.unwrap();
    assert_eq!(client.close_sender().await, Shutdown::Graceful);

    let (server, received) = reader.await.unwrap();
    assert_eq!(received, vec![b"fragile payload".to_vec(), b"second".to_vec()]);
    assert_eq!(client_sim.stats().corrupted, 1);
    server.close_receiver().await;
}

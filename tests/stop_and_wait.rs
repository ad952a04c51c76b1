//! Integration tests for the Stop-and-Wait engine.
//!
//! Stop-and-Wait has no background tasks: a peer only ACKs while one of its
//! own `send`/`recv` calls is reading.  The tests keep the reading side busy
//! in a spawned task accordingly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rdt_transport::{
    packet::PacketKind,
    simulator::{Simulator, SimulatorConfig},
    socket::Socket,
    Connection, Discipline, Listener, RdtConfig, RdtError, Shutdown,
};

fn sw_config() -> RdtConfig {
    RdtConfig::default()
        .with_discipline(Discipline::StopAndWait)
        .with_resend_time(Duration::from_millis(40))
}

async fn ephemeral() -> Socket {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

#[tokio::test]
async fn ping_pong_then_graceful_close() {
    let listener = Listener::from_socket(ephemeral().await, sw_config());
    listener.listen(1);
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.expect("accept");
        assert_eq!(conn.recv().await.expect("server recv"), b"Ping!");
        conn.send(b"Pong!").await.expect("server send");
        assert!(conn.recv().await.unwrap().is_empty(), "FIN must read as end of stream");
        assert!(conn.recv().await.unwrap().is_empty(), "end of stream is sticky");
        conn
    });

    let client = Connection::connect(server_addr, sw_config()).await.expect("connect");
    assert_eq!(client.discipline(), Discipline::StopAndWait);

    client.send(b"Ping!").await.expect("client send");
    assert_eq!(client.recv().await.expect("client recv"), b"Pong!");

    let outcome = tokio::time::timeout(Duration::from_secs(5), client.close_sender())
        .await
        .expect("close_sender hung");
    assert_eq!(outcome, Shutdown::Graceful);

    let server = server.await.unwrap();
    server.close_receiver().await;
}

/// Every message survives 20% loss in both directions and arrives once, in
/// order.
#[tokio::test]
async fn lossy_link_delivers_in_order() {
    const MSG_COUNT: usize = 10;

    let server_sim = Arc::new(Simulator::new(SimulatorConfig::lossy(0.2, 3)));
    let listener = Listener::from_socket(ephemeral().await.with_simulator(server_sim), sw_config());
    listener.listen(1);
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        loop {
            let data = conn.recv().await.expect("server recv");
            if data.is_empty() {
                break;
            }
            received.push(data);
        }
        (conn, received)
    });

    let client_sim = Arc::new(Simulator::new(SimulatorConfig::lossy(0.2, 4)));
    let client = Connection::connect_on(ephemeral().await.with_simulator(client_sim), server_addr, sw_config())
        .await
        .expect("connect");

    for i in 0..MSG_COUNT {
        client.send(format!("msg-{i}").as_bytes()).await.expect("client send");
    }

    // A lost FIN-ACK cannot be repaired once the server stops reading, so
    // both clean outcomes are acceptable; the data itself is not.
    let outcome = client.close_sender().await;
    assert!(matches!(outcome, Shutdown::Graceful | Shutdown::PeerUnresponsive), "got {outcome}");

    let (conn, received) = server.await.unwrap();
    let expected: Vec<Vec<u8>> = (0..MSG_COUNT).map(|i| format!("msg-{i}").into_bytes()).collect();
    assert_eq!(received, expected);
    conn.close_receiver().await;
}

/// Nobody reads on the server side, so nothing is ever ACKed and `send`
/// gives up after its retry budget.
#[tokio::test]
async fn unanswered_send_loses_the_connection() {
    let listener = Listener::from_socket(ephemeral().await, sw_config());
    listener.listen(1);

    let config = sw_config().with_retries(3).with_resend_time(Duration::from_millis(30));
    let client = Connection::connect(listener.local_addr(), config).await.unwrap();
    let (_idle_server, _) = listener.accept().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.send(b"hello?"))
        .await
        .expect("send hung");
    assert!(matches!(result, Err(RdtError::LostConnection)), "got {result:?}");
    assert!(matches!(client.send(b"again").await, Err(RdtError::LostConnection)));
    assert_eq!(client.close_sender().await, Shutdown::ConnectionLost);
}

/// A data packet corrupted in flight is dropped by the receiver; the resent
/// copy is delivered once and end of stream stays sticky after the FIN.
#[tokio::test]
async fn corrupted_packet_is_resent_not_delivered() {
    let listener = Listener::from_socket(ephemeral().await, sw_config());
    listener.listen(1);
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        loop {
            let data = conn.recv().await.expect("server recv");
            if data.is_empty() {
                break;
            }
            received.push(data);
        }
        for _ in 0..3 {
            assert!(conn.recv().await.unwrap().is_empty(), "end of stream is sticky");
        }
        (conn, received)
    });

    let client_sim = Arc::new(Simulator::passthrough());
    client_sim.corrupt_next(PacketKind::Data, 1);
    let client = Connection::connect_on(
        ephemeral().await.with_simulator(Arc::clone(&client_sim)),
        server_addr,
        sw_config(),
    )
    .await
    .expect("connect");

    client.send(b"fragile payload").await.expect("first send");
    client.send(b"second").await.expect("second send");

    let outcome = tokio::time::timeout(Duration::from_secs(5), client.close_sender())
        .await
        .expect("close_sender hung");
    assert_eq!(outcome, Shutdown::Graceful);

    let (conn, received) = server.await.unwrap();
    assert_eq!(received, vec![b"fragile payload".to_vec(), b"second".to_vec()]);
    assert_eq!(client_sim.stats().corrupted, 1);
    conn.close_receiver().await;
}

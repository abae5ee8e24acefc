use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::Data, Message},
};
use udpws::client::{Client, ClientConfig};
use udpws::server::{Peer, Server, ServerConfig};
use udpws::session::{reverse_key, SessionTable};
use udpws::transport::{self, data_frame};

async fn start(listen_addr: &str) -> (String, SessionTable<Peer>) {
    let s = Server::new(ServerConfig {
        listen_addr: listen_addr.to_string(),
        path: "/path".to_string(),
        buffer_size: 1600,
        timeout: Duration::from_secs(30),
        handshake_timeout: None,
    })
    .await
    .unwrap();
    let url = format!("ws://{}/path", s.local_addr().unwrap());
    let sessions = s.sessions();
    tokio::spawn(s.run());
    (url, sessions)
}

fn bridge(url: &str, src: &str, dst: &str, key: &str) -> Client {
    Client::new(ClientConfig {
        server_url: url.to_string(),
        local_src: src.to_string(),
        local_dst: dst.to_string(),
        session_key: key.to_string(),
        buffer_size: 1600,
        timeout: Duration::from_secs(30),
    })
}

/// The application end of a bridge: bound to the bridge's destination.
async fn app(src: &str, dst: &str) -> UdpSocket {
    let s = UdpSocket::bind(dst).await.unwrap();
    s.connect(src).await.unwrap();
    s
}

async fn free_udp_addr() -> String {
    let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    s.local_addr().unwrap().to_string()
}

async fn wait_registered(sessions: &SessionTable<Peer>, reg_key: &[u8]) {
    for _ in 0..200 {
        if sessions.load(reg_key).is_some() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{:?} never registered", reg_key);
}

async fn recv(s: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0; 1600];
    let n = timeout(Duration::from_secs(2), s.recv(&mut buf))
        .await
        .expect("no datagram in time")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_bridges_tunnel_udp() {
    let (url, sessions) = start("127.0.0.1:57414").await;

    let (src_a, dst_a, key_a) = ("127.0.0.1:51374", "127.0.0.1:53458", "Aj84Xos945x");
    let (src_b, dst_b, key_b) = ("127.0.0.1:51373", "127.0.0.1:53452", "x549soX48jA");
    assert_eq!(reverse_key(key_a.as_bytes()), key_b.as_bytes());

    let conn_a = app(src_a, dst_a).await;
    let conn_b = app(src_b, dst_b).await;

    let a = bridge(&url, src_a, dst_a, key_a);
    let b = bridge(&url, src_b, dst_b, key_b);
    tokio::spawn(async move { a.run().await });
    tokio::spawn(async move { b.run().await });

    wait_registered(&sessions, key_a.as_bytes()).await;
    wait_registered(&sessions, key_b.as_bytes()).await;

    conn_a.send(b"hello world").await.unwrap();
    assert_eq!(recv(&conn_b).await, b"hello world");

    conn_b.send(b"hello world 2").await.unwrap();
    assert_eq!(recv(&conn_a).await, b"hello world 2");
}

#[tokio::test]
async fn test_bridge_delivers_raw_text() {
    let (url, sessions) = start("127.0.0.1:0").await;
    let (src, dst) = (free_udp_addr().await, free_udp_addr().await);
    let conn = app(&src, &dst).await;

    let c = bridge(&url, &src, &dst, "abc");
    tokio::spawn(async move { c.run().await });
    wait_registered(&sessions, b"cba").await;

    // a peer that puts arbitrary bytes in text frames
    let (_r, mut w) = transport::connect(&url, 1600).await.unwrap();
    w.write(data_frame(b"cba".to_vec(), Data::Text)).await.unwrap();
    wait_registered(&sessions, b"abc").await;

    w.write(data_frame(vec![0xff, 0xfe, 0x01], Data::Text))
        .await
        .unwrap();
    assert_eq!(recv(&conn).await, vec![0xff, 0xfe, 0x01]);
}

#[tokio::test]
async fn test_bridge_ends_when_preempted() {
    let (url, sessions) = start("127.0.0.1:0").await;
    let (src, dst) = (free_udp_addr().await, free_udp_addr().await);

    let c = bridge(&url, &src, &dst, "abc");
    let run = tokio::spawn(async move { c.run().await });
    wait_registered(&sessions, b"cba").await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text("abc".to_string())).await.unwrap();

    let res = timeout(Duration::from_secs(2), run)
        .await
        .expect("bridge still running")
        .unwrap();
    assert!(res.is_err());
}

#[tokio::test]
async fn test_bridge_dial_failure() {
    let (src, dst) = (free_udp_addr().await, free_udp_addr().await);
    let closed = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let c = bridge(&format!("ws://{}/path", closed), &src, &dst, "abc");
    assert!(c.run().await.is_err());
}

#[tokio::test]
async fn test_bridge_bad_local_addr() {
    let c = bridge("ws://127.0.0.1:1/path", "not an address", "127.0.0.1:6000", "abc");
    assert!(c.run().await.is_err());
}

use crate::transport::{self, data_frame, is_data, Reader, Writer};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::{
    net::{lookup_host, UdpSocket},
    select,
    time::timeout,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::Data;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// relay websocket url, e.g. `ws://127.0.0.1:30000/path`
    pub server_url: String,
    /// local udp address the bridge binds
    pub local_src: String,
    /// local udp address datagrams are delivered to
    pub local_dst: String,
    /// announced to the relay, the peer must use the reversed key
    pub session_key: String,
    /// max datagram size
    pub buffer_size: usize,
    /// idle limit for tunnel reads and writes
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:30000/path".to_string(),
            local_src: "127.0.0.1:5000".to_string(),
            local_dst: "127.0.0.1:6000".to_string(),
            session_key: "abcdef".to_string(),
            buffer_size: 10240,
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Udp to websocket bridge
///
/// # example
/// ```no_run
/// use udpws::client::{Client, ClientConfig};
///
/// # async fn bridge() -> std::io::Result<()> {
/// let c = Client::new(ClientConfig {
///     server_url: "ws://relay:30000/path".into(),
///     session_key: "abcdef".into(),
///     ..Default::default()
/// });
/// c.run().await
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn resolve(addr: &str) -> Result<SocketAddr> {
        lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::Other, format!("{} resolve fail", addr)))
    }

    fn bind(local_addr: SocketAddr, dst_addr: SocketAddr) -> Result<UdpSocket> {
        let domain = Domain::for_address(local_addr);
        let s = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        s.set_reuse_address(true)?;
        s.set_nonblocking(true)?;
        s.bind(&local_addr.into())?;
        s.connect(&dst_addr.into())?;

        UdpSocket::from_std(s.into())
    }

    /// Bridge one session until either direction fails.
    pub async fn run(&self) -> Result<()> {
        let c = &self.config;
        let src_addr = Self::resolve(&c.local_src).await?;
        let dst_addr = Self::resolve(&c.local_dst).await?;
        let socket = Self::bind(src_addr, dst_addr)?;

        let (mut r, mut w) = transport::connect(&c.server_url, c.buffer_size).await?;
        let key = data_frame(c.session_key.clone().into_bytes(), Data::Text);
        w.write_timeout(key, c.timeout).await?;

        log::info!(
            "bridging {} <-> {}, at {} using session {}",
            c.local_src,
            c.local_dst,
            c.server_url,
            c.session_key
        );

        // whichever direction ends first cancels the other
        let res = select! {
            res = Self::udp_to_ws(&socket, &mut w, c.buffer_size, c.timeout) => {
                log::info!("client -> server ended");
                res
            }
            res = Self::ws_to_udp(&mut r, &socket, c.buffer_size, c.timeout) => {
                log::info!("server -> client ended");
                res
            }
        };

        w.close(c.timeout).await;
        res
    }

    async fn udp_to_ws(
        socket: &UdpSocket,
        w: &mut Writer,
        buffer_size: usize,
        deadline: Duration,
    ) -> Result<()> {
        let mut buf = vec![0; buffer_size];
        loop {
            let n = socket.recv(&mut buf).await?;
            log::debug!("client -> server, size: {}", n);
            w.write_timeout(data_frame(buf[..n].to_vec(), Data::Binary), deadline)
                .await?;
        }
    }

    /// Text and binary frames alike become datagrams, fragments are joined.
    async fn ws_to_udp(
        r: &mut Reader,
        socket: &UdpSocket,
        buffer_size: usize,
        deadline: Duration,
    ) -> Result<()> {
        let mut datagram = Vec::new();
        loop {
            let frame = r.read_timeout(deadline).await?;
            if !is_data(&frame) {
                continue;
            }

            let is_final = frame.header().is_final;
            datagram.extend_from_slice(frame.payload());
            if datagram.len() > buffer_size {
                return Err(Error::new(ErrorKind::InvalidData, "fragmented message too large"));
            }
            if !is_final {
                continue;
            }

            log::debug!("server -> client, size: {}", datagram.len());
            timeout(deadline, socket.send(&datagram))
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "timeout writing datagram"))??;
            datagram.clear();
        }
    }
}

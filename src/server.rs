use crate::session::{reverse_key, SessionTable};
use crate::transport::{self, is_data, Reader, Writer};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{watch, Mutex},
    task,
    time::timeout,
};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
    protocol::frame::{
        coding::{Control, OpCode},
        Frame,
    },
};

/// upper bound on sending the final close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// tcp listen address
    pub listen_addr: String,
    /// websocket upgrade path, other paths get 404
    pub path: String,
    /// max frame size
    pub buffer_size: usize,
    /// idle limit for every relay read and write
    pub timeout: Duration,
    /// bound on upgrade plus first frame, unbounded if `None`
    pub handshake_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:30000".to_string(),
            path: "/path".to_string(),
            buffer_size: 10240,
            timeout: Duration::from_secs(3600),
            handshake_timeout: None,
        }
    }
}

/// A registered connection, as seen by its partner.
///
/// Once closed, writes to it stop waiting and drop their frame, so
/// closing never depends on who currently holds the writer.
#[derive(Clone)]
pub struct Peer {
    id: u64,
    writer: Arc<Mutex<Writer>>,
    closed: Arc<watch::Sender<bool>>,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Peer {
    fn new(id: u64, writer: Writer) -> Self {
        Self {
            id,
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(watch::channel(false).0),
        }
    }

    /// connection id, unique within one server
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the connection closed. Wakes its owner and aborts pending writes.
    fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn wait_closed(&self) {
        let _ = self.closed.subscribe().wait_for(|closed| *closed).await;
    }

    /// Write one frame.
    ///
    /// `Ok(false)` if the connection was closed before the frame went out.
    async fn send(&self, frame: Frame, deadline: Duration) -> Result<bool> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write(frame).await
        };

        select! {
            biased;
            _ = self.wait_closed() => Ok(false),
            res = timeout(deadline, write) => {
                res.map_err(|_| Error::new(ErrorKind::TimedOut, "timeout writing frame"))??;
                Ok(true)
            }
        }
    }
}

/// Websocket rendezvous relay
///
/// pair connections by reversed session key, and forward frames between them.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    sessions: SessionTable<Peer>,
    count: u64,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            sessions: Default::default(),
            count: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the live session table.
    pub fn sessions(&self) -> SessionTable<Peer> {
        self.sessions.clone()
    }

    fn next_id(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    /// Accept until the listener fails.
    pub async fn run(mut self) -> Result<()> {
        log::info!(
            "listening on {}{}",
            self.local_addr()?,
            self.config.path
        );

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let h = PeerHandler {
                id: self.next_id(),
                config: self.config.clone(),
                sessions: self.sessions.clone(),
            };

            task::spawn(async move {
                h.handle_stream(stream, addr).await;
            });
        }
    }
}

struct PeerHandler {
    id: u64,
    config: Arc<ServerConfig>,
    sessions: SessionTable<Peer>,
}

impl PeerHandler {
    async fn handle_stream(self, stream: TcpStream, addr: SocketAddr) {
        let handshake = self.handshake(stream);
        let res = match self.config.handshake_timeout {
            Some(t) => timeout(t, handshake)
                .await
                .unwrap_or_else(|_| Err(Error::new(ErrorKind::TimedOut, "handshake timeout"))),
            None => handshake.await,
        };

        match res {
            Ok((key, reader, writer)) => self.relay(key, reader, writer).await,
            Err(e) => log::debug!("failed to read session key from {}: {}", addr, e),
        }
    }

    /// Upgrade, then take the raw payload of the first data frame as the key.
    async fn handshake(&self, stream: TcpStream) -> Result<(Vec<u8>, Reader, Writer)> {
        let path = self.config.path.clone();
        let check_path = move |req: &Request, resp: Response| {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(None);
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };

        let (mut reader, writer) =
            transport::accept(stream, check_path, self.config.buffer_size).await?;

        loop {
            let frame = reader.read().await?;
            if is_data(&frame) {
                return Ok((frame.into_data(), reader, writer));
            }
        }
    }

    async fn relay(self, key: Vec<u8>, mut reader: Reader, writer: Writer) {
        let name = String::from_utf8_lossy(&key).into_owned();
        let reg_key = reverse_key(&key);
        let me = Peer::new(self.id, writer);

        log::info!("got {} connection", name);
        self.register(&reg_key, &me);

        if let Err(e) = self.forward(&key, &me, &mut reader).await {
            log::debug!("relay for {} stopped: {}", name, e);
        }

        // release any partner blocked writing to us before taking the writer
        me.close();
        self.sessions.compare_and_delete(&reg_key, &me);
        let _ = timeout(CLOSE_TIMEOUT, async {
            me.writer.lock().await.close(CLOSE_TIMEOUT).await;
        })
        .await;
        log::info!("{} connection ended", name);
    }

    /// The newest registration always wins.
    fn register(&self, reg_key: &[u8], me: &Peer) {
        let (current, stored) = self.sessions.load_or_store(reg_key, me.clone());
        if stored {
            return;
        }

        log::info!("closing {}", String::from_utf8_lossy(reg_key));
        current.close();
        if let Some(displaced) = self.sessions.swap(reg_key, me.clone()) {
            if displaced != current {
                displaced.close();
            }
        }
    }

    /// Forward frames as they arrive, opcode and payload untouched.
    async fn forward(&self, key: &[u8], me: &Peer, reader: &mut Reader) -> Result<()> {
        let name = String::from_utf8_lossy(key);
        let deadline = self.config.timeout;
        loop {
            let frame = select! {
                _ = me.wait_closed() => {
                    return Err(Error::new(ErrorKind::Other, "preempted"));
                }
                frame = reader.read_timeout(deadline) => frame?,
            };

            match frame.header().opcode {
                OpCode::Control(Control::Ping) => {
                    me.send(Frame::pong(frame.into_data()), deadline).await?;
                    continue;
                }
                OpCode::Control(_) => continue,
                OpCode::Data(_) => {}
            }

            match self.sessions.load(key) {
                Some(peer) => {
                    if !peer.send(frame, deadline).await? {
                        log::debug!("peer for {} closed, frame dropped", name);
                    }
                }
                None => log::debug!("cannot find peer for {}", name),
            }
        }
    }
}

use std::io::Result;
use std::time::Duration;
use structopt::StructOpt;
use udpws::client::{Client, ClientConfig};
use udpws::server::{Server, ServerConfig};

#[derive(StructOpt, Debug)]
#[structopt(name = "udpws")]
struct Opt {
    /// max UDP datagram and websocket frame size in bytes
    #[structopt(long = "buffer-size", default_value = "10240")]
    buffer_size: usize,

    /// session timeout in seconds
    #[structopt(long = "timeout", default_value = "3600")]
    timeout: u64,

    /// seconds to sleep before restarting
    #[structopt(long = "restart-sleep", default_value = "1")]
    restart_sleep: u64,

    #[structopt(long = "verbose")]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt, Debug)]
enum Cmd {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-ws-url", default_value = "ws://127.0.0.1:30000/path")]
    server_ws_url: String,

    #[structopt(long = "local-src", default_value = "127.0.0.1:5000")]
    local_src: String,

    #[structopt(long = "local-dst", default_value = "127.0.0.1:6000")]
    local_dst: String,

    /// the peer must use this key reversed
    #[structopt(long = "session-key", default_value = "abcdef")]
    session_key: String,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "server-bind", default_value = "127.0.0.1:30000")]
    server_bind: String,

    #[structopt(long = "server-path", default_value = "/path")]
    server_path: String,

    /// seconds allowed for the upgrade and session key, unbounded if unset
    #[structopt(long = "handshake-timeout")]
    handshake_timeout: Option<u64>,
}

fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() {
    let opt: Opt = StructOpt::from_args();
    init_logger(opt.verbose);

    loop {
        let res = match opt.cmd {
            Cmd::Server(ref s) => run_server(&opt, s).await,
            Cmd::Client(ref c) => run_client(&opt, c).await,
        };

        match res {
            Ok(()) => log::info!("session ended"),
            Err(e) => log::warn!("{}", e),
        }

        log::info!("restarting in {} seconds...", opt.restart_sleep);
        tokio::time::sleep(Duration::from_secs(opt.restart_sleep)).await;
    }
}

async fn run_server(opt: &Opt, s: &ServerOpt) -> Result<()> {
    let config = ServerConfig {
        listen_addr: s.server_bind.clone(),
        path: s.server_path.clone(),
        buffer_size: opt.buffer_size,
        timeout: Duration::from_secs(opt.timeout),
        handshake_timeout: s.handshake_timeout.map(Duration::from_secs),
    };

    Server::new(config).await?.run().await
}

async fn run_client(opt: &Opt, c: &ClientOpt) -> Result<()> {
    let config = ClientConfig {
        server_url: c.server_ws_url.clone(),
        local_src: c.local_src.clone(),
        local_dst: c.local_dst.clone(),
        session_key: c.session_key.clone(),
        buffer_size: opt.buffer_size,
        timeout: Duration::from_secs(opt.timeout),
    };

    Client::new(config).run().await
}

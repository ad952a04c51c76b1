//! Entry point for `rdt`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).
//!
//! ```text
//! rdt server --bind 0.0.0.0:9000            # print what every client sends
//! rdt client --server 127.0.0.1:9000        # send stdin, one message per line
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use rdt_transport::{Connection, Discipline, Listener, RdtConfig};

/// Reliable transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server, printing messages from every accepted connection.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Maximum number of handshakes waiting to be accepted.
        #[arg(long, default_value_t = 8)]
        backlog: usize,
        #[command(flatten)]
        transport: TransportArgs,
    },
    /// Run as a client, sending each line of stdin as one message.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        #[command(flatten)]
        transport: TransportArgs,
    },
}

#[derive(Args)]
struct TransportArgs {
    /// Use stop-and-wait instead of selective repeat.
    #[arg(long)]
    stop_and_wait: bool,
    /// Selective-repeat window size, in packets.
    #[arg(long, default_value_t = 8)]
    window: usize,
    /// Retry budget for handshake, retransmission and FIN.
    #[arg(long, default_value_t = 17)]
    retries: u32,
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    resend_ms: u64,
}

impl TransportArgs {
    fn config(&self) -> RdtConfig {
        let discipline = if self.stop_and_wait {
            Discipline::StopAndWait
        } else {
            Discipline::SelectiveRepeat
        };
        RdtConfig::default()
            .with_discipline(discipline)
            .with_window_size(self.window)
            .with_retries(self.retries)
            .with_resend_time(Duration::from_millis(self.resend_ms))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            backlog,
            transport,
        } => run_server(bind, backlog, transport.config()).await,
        Mode::Client { server, transport } => run_client(server, transport.config()).await,
    }
}

async fn run_server(bind: SocketAddr, backlog: usize, config: RdtConfig) -> anyhow::Result<()> {
    log::info!("Starting {} server on {bind}", config.discipline);
    let listener = Listener::bind(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    listener.listen(backlog);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, peer) = accepted.context("accept failed")?;
                tokio::spawn(serve(conn, peer));
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted; shutting down");
                break;
            }
        }
    }

    listener.close_server().await;
    Ok(())
}

async fn serve(conn: Connection, peer: SocketAddr) {
    loop {
        match conn.recv().await {
            Ok(message) if message.is_empty() => break,
            Ok(message) => println!("[{peer}] {}", String::from_utf8_lossy(&message)),
            Err(e) => {
                log::warn!("connection with {peer} failed: {e}");
                break;
            }
        }
    }
    conn.close_receiver().await;
    log::info!("{peer} disconnected");
}

async fn run_client(server: SocketAddr, config: RdtConfig) -> anyhow::Result<()> {
    log::info!("Starting {} client, connecting to {server}", config.discipline);
    let conn = Connection::connect(server, config)
        .await
        .with_context(|| format!("connecting to {server}"))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let mut rest = line.as_bytes();
        while !rest.is_empty() {
            let sent = conn.send(rest).await.context("send failed")?;
            rest = &rest[sent..];
        }
    }

    let outcome = conn.close_sender().await;
    log::info!("Connection closed: {outcome}");
    Ok(())
}

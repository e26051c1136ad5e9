//! Command-line file transfer over the reliable-UDP transport.
//!
//! ```text
//! minitcp receive --port 4321 --file out.bin
//! minitcp send    --remote 127.0.0.1:4321 --file in.bin
//! ```
//!
//! The receiver must be started first; the sender performs the active open.
//! Both sides print the transfer statistics report on completion.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use minitcp::engine::{Config, Connection};
use minitcp::pacer::pace;
use minitcp::packet::HEADER_LEN;
use minitcp::socket::Socket;

#[derive(Parser)]
#[command(name = "minitcp", about = "Reliable file transfer over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transmit a file to a listening receiver.
    Send {
        /// Receiver address, e.g. 127.0.0.1:4321.
        #[arg(short, long)]
        remote: SocketAddr,
        /// Local UDP port (0 picks an ephemeral port).
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// File to transmit.
        #[arg(short, long)]
        file: PathBuf,
        /// Maximum datagram size, header included.
        #[arg(long, default_value_t = 1500)]
        mtu: usize,
        /// Sliding-window size in segments.
        #[arg(short, long, default_value_t = 8)]
        window: usize,
    },
    /// Listen for one incoming transfer and write it to a file.
    Receive {
        /// Local UDP port to listen on.
        #[arg(short, long)]
        port: u16,
        /// Destination file (overwritten if it exists).
        #[arg(short, long)]
        file: PathBuf,
        /// Maximum datagram size, header included.
        #[arg(long, default_value_t = 1500)]
        mtu: usize,
        /// Sliding-window size in segments.
        #[arg(short, long, default_value_t = 8)]
        window: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Send {
            remote,
            port,
            file,
            mtu,
            window,
        } => send(remote, port, file, config(mtu, window)?).await,
        Command::Receive {
            port,
            file,
            mtu,
            window,
        } => receive(port, file, config(mtu, window)?).await,
    }
}

fn config(mtu: usize, window: usize) -> Result<Config, Box<dyn std::error::Error>> {
    if mtu <= HEADER_LEN {
        return Err(format!("mtu must exceed the {HEADER_LEN}-byte header").into());
    }
    if window == 0 {
        return Err("window must be at least 1".into());
    }
    Ok(Config {
        mtu,
        window,
        ..Config::default()
    })
}

async fn send(
    remote: SocketAddr,
    port: u16,
    path: PathBuf,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = File::open(&path).await?;
    let socket = Socket::bind(format!("0.0.0.0:{port}").parse()?).await?;
    log::info!("[main] {} → {remote}", socket.local_addr);

    let segment_size = config.max_payload();
    let conn = Connection::connect(socket, remote, config).await?;
    let session = conn.start();

    let outbound = session.outbound.clone();
    let sent = pace(source, segment_size, outbound).await?;
    log::info!("[main] queued {sent} bytes from {}", path.display());

    let (stats, result) = session.finish().await;
    println!("{stats}");
    result.map_err(Into::into)
}

async fn receive(
    port: u16,
    path: PathBuf,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = Socket::bind(format!("0.0.0.0:{port}").parse()?).await?;
    log::info!("[main] listening on {}", socket.local_addr);

    let conn = Connection::accept(socket, config).await?;
    let mut session = conn.start();

    let mut sink = File::create(&path).await?;
    while let Some(chunk) = session.recv().await {
        sink.write_all(&chunk).await?;
    }
    sink.flush().await?;
    log::info!("[main] wrote {}", path.display());

    let (stats, result) = session.finish().await;
    println!("{stats}");
    result.map_err(Into::into)
}

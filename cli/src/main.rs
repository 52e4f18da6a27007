use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use hive_signal::swarm::{
    config::Config,
    conn::{TcpConnection, TcpDialer},
    debrief::LoadPreferenceDebriefer,
    request::Request,
    signal::Signal,
    wire::{read_message, session_description_decoder},
};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upper bound on an intake header. Headers are a few short strings.
const MAX_HEADER_LEN: u64 = 4 * 1024;

#[derive(Parser, Debug)]
#[command(name = "hive-signal", about = "swarm signaling daemon")]
struct Args {
    /// JSON config file. Every field is optional.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Intake address, overriding the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Localize,
    Connect,
    Disconnect,
    Register,
    Deregister,
}

/// The first framed message on every intake connection.
#[derive(Debug, Deserialize)]
struct Header {
    kind: Kind,
    dataspace: String,
    /// Where a joining endpoint can be dialed back. Defaults to the address
    /// it connected from.
    #[serde(default)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listener.address = listen;
    }

    let listener = TcpListener::bind(&config.listener.address)
        .await
        .with_context(|| format!("binding {}", config.listener.address))?;
    info!(address = %config.listener.address, "accepting requests");

    let signal = Arc::new(Signal::start(
        config,
        Arc::new(TcpDialer),
        Arc::new(LoadPreferenceDebriefer),
        session_description_decoder(),
    ));

    tokio::select! {
        accepted = accept(listener, signal.clone()) => accepted?,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }
    signal.shutdown().await;
    Ok(())
}

async fn accept(listener: TcpListener, signal: Arc<Signal>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        let signal = signal.clone();
        tokio::spawn(async move {
            if let Err(e) = intake(stream, &signal).await {
                warn!(%peer, error = %e, "rejected request");
            }
        });
    }
}

/// Reads the header off a fresh connection and hands the request to the
/// signal along with the connection itself.
async fn intake(mut stream: TcpStream, signal: &Signal) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let raw = read_message(&mut stream, MAX_HEADER_LEN).await?;
    let header: Header = serde_json::from_slice(&raw).context("decoding request header")?;
    debug!(?header, "received request");

    let conn = match header.address {
        Some(address) => TcpConnection::with_address(stream, address),
        None => TcpConnection::new(stream)?,
    };
    let dataspace = header.dataspace;
    let request = match header.kind {
        Kind::Localize => Request::Localize {
            dataspace,
            conn: Box::new(conn),
        },
        Kind::Connect => Request::Connect {
            dataspace,
            conn: Box::new(conn),
        },
        Kind::Disconnect => Request::Disconnect {
            dataspace,
            conn: Box::new(conn),
        },
        Kind::Register => Request::Register { dataspace },
        Kind::Deregister => Request::Deregister { dataspace },
    };
    signal.submit(request).await?;
    Ok(())
}

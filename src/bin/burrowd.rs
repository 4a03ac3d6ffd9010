//! burrowd - IP-over-DNS tunnel server daemon
//!
//! Binds the DNS sockets, wires the virtual-interface seam to a backend,
//! and runs the tunnel core. The real tun/tap bridge lives outside the
//! core; for development and tests the `--tun-udp` backend relays IP
//! datagrams over a plain UDP socket instead.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;

use burrow::tun::TunBackend;
use burrow::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "burrowd")]
#[command(version)]
#[command(about = "IP-over-DNS tunnel server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parent domain to answer for (overrides config file)
    #[arg(short, long)]
    domain: Option<String>,

    /// Tunnel password (overrides config file)
    #[arg(short, long, env = "BURROW_PASSWORD")]
    password: Option<String>,

    /// DNS listen address (overrides config file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// UDP backend for the virtual-interface seam: datagrams to clients
    /// are sent out this socket, datagrams received on it go to clients
    #[arg(long, value_name = "BIND_ADDR")]
    tun_udp: Option<SocketAddr>,

    /// Fixed peer for the UDP backend; defaults to the last sender
    #[arg(long, value_name = "ADDR", requires = "tun_udp")]
    tun_peer: Option<SocketAddr>,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(domain) = cli.domain {
        config.topdomain = domain;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    let (handle, backend) = burrow::tun::channel();
    match cli.tun_udp {
        Some(bind) => {
            tokio::spawn(run_udp_backend(backend, bind, cli.tun_peer));
        }
        None => {
            log::warn!("no interface backend configured, tunneled datagrams go nowhere");
            tokio::spawn(run_sink_backend(backend));
        }
    }

    let server = Server::bind(config, handle)
        .await
        .context("binding server sockets")?;
    log::info!("burrowd {} running", env!("CARGO_PKG_VERSION"));
    server.run().await.context("server loop")?;
    Ok(())
}

/// Relay IP datagrams between the interface seam and a UDP socket.
async fn run_udp_backend(
    mut backend: TunBackend,
    bind: SocketAddr,
    peer: Option<SocketAddr>,
) -> Result<()> {
    let sock = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("binding tun backend on {bind}"))?;
    log::info!("tun UDP backend on {}", sock.local_addr()?);

    let mut last_peer = peer;
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            r = sock.recv_from(&mut buf) => {
                let (n, from) = r.context("tun backend recv")?;
                last_peer = Some(peer.unwrap_or(from));
                if backend.tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            pkt = backend.rx.recv() => match pkt {
                Some(datagram) => {
                    if let Some(to) = last_peer {
                        if let Err(e) = sock.send_to(&datagram, to).await {
                            log::warn!("tun backend send: {e}");
                        }
                    }
                }
                None => break,
            },
        }
    }
    Ok(())
}

/// Swallow outbound datagrams when no backend is configured.
async fn run_sink_backend(mut backend: TunBackend) {
    while let Some(datagram) = backend.rx.recv().await {
        log::debug!("sink backend dropped {} byte datagram", datagram.len());
    }
}

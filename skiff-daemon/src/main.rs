// Skiff daemon: announce on the LAN, accept one peer session, serve the
// share root over the control channel and the range transfer port.

mod config;
mod fs;

use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use skiff_core::control::{ControlChannel, ControlEvent};
use skiff_core::discovery::{DecisionFuture, Discovery, DiscoveryConfig, SessionDecision};
use skiff_core::model::DeviceAnnouncement;
use skiff_core::transfer::TransferServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("skiff-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = config::load();
    tracing::info!(
        event = "daemon_starting",
        version = VERSION,
        device_name = %cfg.device_name,
        share_root = %cfg.share_root.display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let share = fs::ShareRoot::new(cfg.share_root.clone());

        let transfer_addr: SocketAddr = format!("0.0.0.0:{}", cfg.transfer_port).parse()?;
        let transfer_server = TransferServer::bind(transfer_addr, share.clone())
            .await
            .context("binding transfer port")?;
        tracing::info!(event = "transfer_listening", addr = %transfer_server.local_addr());

        tokio::select! {
            result = session_loop(&cfg, share) => result,
            result = shutdown_signal() => {
                tracing::info!(event = "daemon_shutdown");
                result
            }
        }
    })
}

/// Run discovery, host one session over the accepted stream, and go back
/// to discovery when the peer disconnects.
async fn session_loop(cfg: &config::Config, share: fs::ShareRoot) -> anyhow::Result<()> {
    loop {
        let mut discovery_config =
            DiscoveryConfig::new(DeviceAnnouncement::new(&cfg.device_name));
        discovery_config.discovery_port = cfg.discovery_port;
        discovery_config.handshake_port = cfg.handshake_port;

        let handle = Discovery::start(discovery_config, accept_all)
            .await
            .context("starting discovery")?;
        tracing::info!(event = "discovery_started", handshake = %handle.handshake_addr());

        let session = match handle.established().await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(event = "discovery_failed", error = %error);
                continue;
            }
        };
        tracing::info!(event = "session_established", peer = %session.peer_addr);

        let peer = session.peer_addr;
        let (_channel, events) = ControlChannel::open(session.stream, share.clone());
        drain_events(events, cfg.download_dir()).await;
        tracing::info!(event = "session_closed", peer = %peer);
    }
}

fn accept_all(remote: SocketAddr, announced_name: String) -> DecisionFuture {
    tracing::info!(event = "session_request", remote = %remote, name = %announced_name);
    Box::pin(async { SessionDecision::Accept })
}

/// Log inbound control traffic until the peer goes away.
async fn drain_events(mut events: mpsc::Receiver<ControlEvent>, download_dir: &std::path::Path) {
    while let Some(event) = events.recv().await {
        match event {
            ControlEvent::Message(body) => {
                tracing::info!(event = "peer_message", body = %body);
            }
            ControlEvent::FilesProposed(files) => {
                let total: u64 = files.iter().map(|f| f.size).sum();
                tracing::info!(
                    event = "files_proposed",
                    count = files.len(),
                    total_bytes = total,
                    download_dir = %download_dir.display()
                );
            }
            ControlEvent::Listing(listing) => {
                tracing::debug!(event = "peer_listing", path = %listing.path);
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        Ok(())
    }
}

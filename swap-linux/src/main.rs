// App Swap for Linux: swap session daemon (radio stand-in + Wi-Fi LAN front), mDNS discovery, CLI client.

mod config;
mod discovery;
mod lan_http;
mod wifi;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use swap_core::{
    FileServer, Peer, RadioAdapter, RadioSwap, SoftRadio, SwapClient, SwapSession, SwapType, TcpTransport,
};

#[derive(Parser, Debug)]
#[command(name = "swap-linux", version, about = "Swap apps with nearby devices")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the swap repository until Ctrl+C or SIGTERM.
    Serve(ServeArgs),
    /// Download a file from a peer, resuming a partial one.
    Get {
        /// Peer address (host:port).
        addr: String,
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show size and cache tag of a file on a peer.
    Head { addr: String, path: String },
    /// Browse the LAN for swap repositories.
    Peers {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Directory to serve (overrides config).
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    no_radio: bool,
    #[arg(long)]
    no_wifi: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("swap_linux=info".parse()?)
                .add_directive("swap_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args),
        Command::Get { addr, path, output } => get(&addr, &path, output),
        Command::Head { addr, path } => head(&addr, &path),
        Command::Peers { seconds } => peers(Duration::from_secs(seconds)),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut cfg = config::load()?;
    if let Some(root) = args.root {
        cfg.web_root = root;
    }
    cfg.enable_radio &= !args.no_radio;
    cfg.enable_wifi &= !args.no_wifi;
    if !cfg.web_root.is_dir() {
        tracing::warn!(root = %cfg.web_root.display(), "web root is not a directory; every request will be 404");
    }

    let files = FileServer::new(&cfg.web_root);
    let mut session = SwapSession::new();
    if cfg.enable_radio {
        let radio = SoftRadio::new(cfg.device_name.clone(), false);
        let probe = radio.clone();
        let transport =
            TcpTransport::new(SocketAddr::from(([0, 0, 0, 0], cfg.radio_port))).gated_by(move || probe.is_enabled());
        let swap = RadioSwap::new(Arc::new(radio), Arc::new(transport), files.clone());
        session.register(Arc::new(SwapType::new(swap, session.bus())));
    }
    if cfg.enable_wifi {
        let mut swap = wifi::WifiSwap::new(files.clone(), cfg.lan_port);
        if cfg.announce {
            swap = swap.announcing(discovery::Announcement {
                device_name: cfg.device_name.clone(),
                port: cfg.lan_port,
                fingerprint: cfg.fingerprint.clone(),
            });
        }
        session.register(Arc::new(SwapType::new(swap, session.bus())));
    }
    let session = Arc::new(session);
    if session.kinds().next().is_none() {
        bail!("both radio and wifi swap are disabled; nothing to serve");
    }

    let status = session.subscribe();
    std::thread::Builder::new()
        .name("swap-status".into())
        .spawn(move || {
            for event in status.iter() {
                tracing::info!(channel = event.channel, status = ?event.status, "swap status");
            }
        })
        .context("Failed to spawn status logger")?;

    for (kind, result) in session.start_all() {
        if result.is_ok() {
            tracing::info!(transport = %kind, "transport up");
        }
    }
    if !session.is_any_active() {
        session.stop_all();
        bail!("no transport came up");
    }

    let browsing = if cfg.announce {
        match discovery::Discovery::new()
            .and_then(|d| discovery::Browser::spawn(&d, session.clone()).map(|b| (d, b)))
        {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!(error = %e, "peer browsing disabled");
                None
            }
        }
    } else {
        None
    };

    tracing::info!(root = %cfg.web_root.display(), device = %cfg.device_name, "swap session running");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    rt.block_on(shutdown_signal())?;
    drop(rt);

    tracing::info!("shutting down swap session");
    if let Some((discovery, mut browser)) = browsing {
        browser.stop();
        let _ = discovery.shutdown();
    }
    for peer in session.peers() {
        tracing::debug!(peer = %peer.name(), locator = %peer.locator(), "peer seen this session");
    }
    session.stop_all();
    Ok(())
}

fn client_for(addr: &str) -> SwapClient {
    let transport = TcpTransport::new(SocketAddr::from(([0, 0, 0, 0], 0)));
    SwapClient::new(Arc::new(transport), addr)
}

fn get(addr: &str, path: &str, output: Option<PathBuf>) -> Result<()> {
    let dest = match output {
        Some(p) => p,
        None => {
            let name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("index.html");
            PathBuf::from(name)
        }
    };
    let client = client_for(addr);
    let mut last_percent = None;
    let outcome = client
        .download(path, &dest, |p| {
            if p.total > 0 {
                let percent = p.downloaded * 100 / p.total as u64;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    tracing::debug!(downloaded = p.downloaded, total = p.total, "{percent}%");
                }
            }
        })
        .with_context(|| format!("download of {path} from {addr} failed"))?;
    println!(
        "{} -> {} ({} bytes{})",
        path,
        dest.display(),
        outcome.file_size,
        if outcome.resumed { ", resumed" } else { "" }
    );
    Ok(())
}

fn head(addr: &str, path: &str) -> Result<()> {
    let details = client_for(addr)
        .head(path)
        .with_context(|| format!("HEAD {path} on {addr} failed"))?;
    if details.is_size_known() {
        println!("size: {}", details.file_size);
    } else {
        println!("size: unknown");
    }
    println!("etag: {}", details.cache_tag.as_deref().unwrap_or("-"));
    Ok(())
}

fn peers(window: Duration) -> Result<()> {
    let found = discovery::collect_peers(window)?;
    if found.is_empty() {
        println!("no swap peers found");
    }
    for peer in found.iter() {
        print_peer(peer);
    }
    Ok(())
}

fn print_peer(peer: &Peer) {
    match peer.fingerprint() {
        Some(fp) => println!("{}\t{}\t{}", peer.name(), peer.locator(), fp.as_str()),
        None => println!("{}\t{}", peer.name(), peer.locator()),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    }
    Ok(())
}

//! Standalone signaling server binary
//!
//! Run with:
//!   cargo run --bin roomdrop-server -- --port 3000
//!
//! With TLS:
//!   cargo run --bin roomdrop-server -- --port 8443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use roomdrop::network::{GroupingMode, ServerConfig, ServerExit, SignalingServer};

/// Signaling and relay server for roomdrop peers
#[derive(Parser, Debug)]
#[command(name = "roomdrop-server")]
#[command(about = "Signaling and relay server for roomdrop peers")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Group peers by network address instead of one shared room
    #[arg(long, env = "ISOLATE")]
    isolate_by_address: bool,

    /// Seconds between pings; silent peers are evicted after twice this
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        if self.heartbeat_secs == 0 {
            bail!("--heartbeat-secs must be at least 1");
        }
        let grouping = if self.isolate_by_address {
            GroupingMode::PerAddress
        } else {
            GroupingMode::SameSegment
        };
        Ok(ServerConfig {
            grouping,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            ..ServerConfig::default()
        })
    }
}

/// Load TLS certificates from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("No certificate found in {}", path.display());
    }
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let addr = format!("{}:{}", args.host, args.port);
    let config = args.server_config()?;

    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            bail!("Both --cert and --key must be provided for TLS");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    info!(
        "Signaling server starting on {} ({:?}, heartbeat {}s)",
        addr, config.grouping, args.heartbeat_secs
    );

    let mut server = SignalingServer::new(config);
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }

    match server.run(&addr, shutdown_signal()).await? {
        ServerExit::Shutdown => {
            info!("Server stopped");
            Ok(())
        }
        ServerExit::Restart => {
            warn!("Restart requested by a peer, exiting");
            std::process::exit(1);
        }
    }
}

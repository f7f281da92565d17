//! roomdrop - send files and text to peers on the same network

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use roomdrop::network::{Capability, ConnectOptions, SignalingClient};
use roomdrop::peer::{
    IceServer, NegotiationState, PeersManager, RtcSettings, SessionConfig, SessionEvent, SessionHandle,
};
use roomdrop::protocol::PeerInfo;
use roomdrop::transfer::{Direction, OutgoingFile, ReceivedFile, TransferEvent};

#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(about = "Send files and text to peers on the same network")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug, Clone)]
struct ConnectArgs {
    /// Signaling server URL (e.g., ws://192.168.1.10:3000)
    #[arg(short, long, env = "ROOMDROP_SERVER", default_value = "ws://localhost:3000")]
    server: String,

    /// Display name to announce
    #[arg(short, long)]
    name: Option<String>,

    /// Join an explicit room instead of the network-derived one
    #[arg(short, long)]
    room: Option<String>,

    /// Send everything through the server relay
    #[arg(long)]
    fallback: bool,

    /// STUN or TURN server URL; repeat for several (default: public STUN)
    #[arg(long = "ice-server", value_name = "URL")]
    ice_servers: Vec<String>,

    /// Username for TURN servers
    #[arg(long, env = "ROOMDROP_ICE_USERNAME")]
    ice_username: Option<String>,

    /// Credential for TURN servers
    #[arg(long, env = "ROOMDROP_ICE_CREDENTIAL", hide_env_values = true)]
    ice_credential: Option<String>,
}

impl ConnectArgs {
    fn options(&self) -> ConnectOptions {
        ConnectOptions {
            capability: if self.fallback {
                Capability::RelayOnly
            } else {
                Capability::DirectChannel
            },
            display_name: self.name.clone(),
            room: self.room.clone(),
            identity: None,
        }
    }

    fn rtc_settings(&self) -> Result<RtcSettings> {
        if self.ice_servers.is_empty() {
            return Ok(RtcSettings::default());
        }
        let mut ice_servers = Vec::with_capacity(self.ice_servers.len());
        for url in &self.ice_servers {
            let server = IceServer::new(url);
            if !server.is_turn() {
                ice_servers.push(server);
                continue;
            }
            match (&self.ice_username, &self.ice_credential) {
                (Some(username), Some(credential)) => {
                    ice_servers.push(server.with_credentials(username, credential))
                }
                _ => bail!("{} needs --ice-username and --ice-credential", url),
            }
        }
        Ok(RtcSettings {
            ice_servers,
            ..RtcSettings::default()
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List peers in the room
    Peers {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Seconds to wait for the peer list
        #[arg(long, default_value = "3")]
        wait: u64,
    },

    /// Send files to a peer
    Send {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Peer identity or display name
        #[arg(short, long)]
        to: String,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Send a text message to a peer
    Text {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Peer identity or display name
        #[arg(short, long)]
        to: String,

        text: String,
    },

    /// Receive files and messages
    Receive {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Directory to store received files
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Exit after this many files
        #[arg(long)]
        count: Option<usize>,
    },
}

/// How long to wait for a named peer to show up
const PEER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to the last frames before disconnecting
const FLUSH_GRACE: Duration = Duration::from_millis(500);

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

struct Session {
    handle: SessionHandle,
    events: UnboundedReceiver<SessionEvent>,
    direct: bool,
}

async fn open_session(args: &ConnectArgs) -> Result<Session> {
    let rtc = args.rtc_settings()?;
    let client = SignalingClient::new(&args.server);
    let options = args.options();
    let connection = client
        .connect(&options)
        .await
        .with_context(|| format!("connecting to {}", args.server))?;

    let config = SessionConfig {
        capability: options.capability,
        rtc,
        ..SessionConfig::default()
    };
    config.transfer.validate()?;
    let (handle, events, _task) = PeersManager::spawn(connection, config);
    Ok(Session {
        handle,
        events,
        direct: !args.fallback,
    })
}

impl Session {
    /// Wait until `needle` (identity or display name) is in the room
    async fn find_peer(&mut self, needle: &str) -> Result<PeerInfo> {
        let deadline = Instant::now() + PEER_LOOKUP_TIMEOUT;
        loop {
            if let Some(peer) = self.handle.directory().find(needle) {
                return Ok(peer);
            }
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(SessionEvent::Disconnected)) | Ok(None) => {
                    bail!("Disconnected before {} appeared", needle)
                }
                Ok(Some(_)) => {}
                Err(_) => bail!("No peer named {} in the room", needle),
            }
        }
    }

    async fn close(self) {
        let _ = self.handle.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn list_peers(args: &ConnectArgs, wait: u64) -> Result<()> {
    let mut session = open_session(args).await?;
    let deadline = Instant::now() + Duration::from_secs(wait);

    let mut me = None;
    let mut listed = false;
    while !(listed && me.is_some()) {
        match timeout_at(deadline, session.events.recv()).await {
            Ok(Some(SessionEvent::Welcome { display_name, .. })) => me = Some(display_name),
            Ok(Some(SessionEvent::Peers(_))) => listed = true,
            Ok(Some(SessionEvent::Disconnected)) | Ok(None) => bail!("Server closed the connection"),
            Ok(Some(_)) => {}
            Err(_) => break,
        }
    }

    if let Some(me) = me {
        println!("You are: {}", me);
    }
    let peers = session.handle.directory().list();
    if peers.is_empty() {
        println!("No other peers in the room");
    }
    for peer in peers {
        let path = if peer.rtc_supported { "direct" } else { "relay" };
        println!(
            "  {} ({}) [{}] {}",
            peer.name.display_name, peer.name.device_name, path, peer.id
        );
    }

    session.close().await;
    Ok(())
}

async fn send_files(args: &ConnectArgs, to: &str, paths: &[PathBuf]) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = OutgoingFile::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        files.push(file);
    }

    let mut session = open_session(args).await?;
    let peer = session.find_peer(to).await?;
    info!("Sending {} file(s) to {}", files.len(), peer.name.display_name);

    let mut remaining = files.len();
    session.handle.send_files(&peer.id, files)?;

    let mut failed = false;
    while remaining > 0 {
        let Some(event) = session.events.recv().await else {
            bail!("Session ended unexpectedly");
        };
        match event {
            SessionEvent::Transfer(TransferEvent::Progress {
                direction: Direction::Sending,
                progress,
                ..
            }) => println!("  {:>3}%", (progress * 100.0).round() as u32),
            SessionEvent::Transfer(TransferEvent::FileSent { name, .. }) => {
                println!("Sent {}", name);
                remaining -= 1;
            }
            SessionEvent::Transfer(TransferEvent::TransferFailed { name, reason, .. }) => {
                warn!("Failed to send {}: {}", name, reason);
                failed = true;
                remaining -= 1;
            }
            SessionEvent::Transfer(TransferEvent::RemoteCancelled { .. }) => {
                bail!("{} cancelled the transfer", peer.name.display_name)
            }
            SessionEvent::PeerLeft(id) if id == peer.id => {
                bail!("{} left the room", peer.name.display_name)
            }
            SessionEvent::Disconnected => bail!("Server closed the connection"),
            _ => {}
        }
    }

    session.close().await;
    if failed {
        bail!("Some files were not sent");
    }
    Ok(())
}

async fn send_text(args: &ConnectArgs, to: &str, text: &str) -> Result<()> {
    let mut session = open_session(args).await?;
    let peer = session.find_peer(to).await?;
    session.handle.send_text(&peer.id, text)?;

    // Direct frames stay buffered until the channel is up
    if session.direct && peer.rtc_supported {
        let deadline = Instant::now() + PEER_LOOKUP_TIMEOUT;
        loop {
            match timeout_at(deadline, session.events.recv()).await {
                Ok(Some(SessionEvent::LinkState {
                    peer: id,
                    state: NegotiationState::ChannelOpen,
                })) if id == peer.id => break,
                Ok(Some(SessionEvent::Disconnected)) | Ok(None) => {
                    bail!("Server closed the connection")
                }
                Ok(Some(_)) => {}
                Err(_) => bail!("Could not open a channel to {}", peer.name.display_name),
            }
        }
    }
    tokio::time::sleep(FLUSH_GRACE).await;
    println!("Sent message to {}", peer.name.display_name);

    session.close().await;
    Ok(())
}

/// `dir/name`, or `dir/name (n)` when taken
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("received");

    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{} ({})", name, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

async fn store(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    let path = unique_path(dir, &file.name);
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

async fn receive(args: &ConnectArgs, dir: &Path, count: Option<usize>) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let mut session = open_session(args).await?;
    let mut received = 0usize;
    println!("Waiting for files (Ctrl-C to stop)");

    loop {
        let event = tokio::select! {
            event = session.events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(event) = event else { break };

        match event {
            SessionEvent::Welcome { display_name, .. } => println!("You are: {}", display_name),
            SessionEvent::PeerJoined(peer) => println!("{} joined", peer.name.display_name),
            SessionEvent::PeerLeft(id) => println!("{} left", id),
            SessionEvent::Transfer(TransferEvent::IncomingFile { name, size, .. }) => {
                println!("Receiving {} ({} bytes)", name, size)
            }
            SessionEvent::Transfer(TransferEvent::Progress {
                direction: Direction::Receiving,
                progress,
                ..
            }) => println!("  {:>3}%", (progress * 100.0).round() as u32),
            SessionEvent::Transfer(TransferEvent::FileReceived { file, .. }) => {
                let path = store(dir, &file).await?;
                println!("Saved {}", path.display());
                received += 1;
                if count.is_some_and(|n| received >= n) {
                    break;
                }
            }
            SessionEvent::Transfer(TransferEvent::TextReceived { sender, text, .. }) => {
                println!("{}: {}", sender, text)
            }
            SessionEvent::Transfer(TransferEvent::RemoteCancelled { peer }) => {
                println!("{} cancelled the transfer", peer)
            }
            SessionEvent::Disconnected => bail!("Server closed the connection"),
            _ => {}
        }
    }

    session.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Peers { connect, wait } => list_peers(&connect, wait).await,
        Commands::Send { connect, to, files } => send_files(&connect, &to, &files).await,
        Commands::Text { connect, to, text } => send_text(&connect, &to, &text).await,
        Commands::Receive {
            connect,
            dir,
            count,
        } => receive(&connect, &dir, count).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop::peer::DEFAULT_STUN_SERVER;
    use tokio_test::assert_err;

    fn connect_args(args: &[&str]) -> ConnectArgs {
        let cli = Cli::parse_from(args);
        match cli.command {
            Commands::Peers { connect, .. } => connect,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_default_ice_server() {
        let args = connect_args(&["roomdrop", "peers"]);
        let settings = args.rtc_settings().unwrap();
        assert_eq!(settings.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
    }

    #[test]
    fn test_turn_server_with_credentials() {
        let args = connect_args(&[
            "roomdrop",
            "peers",
            "--ice-server",
            "stun:stun.example.org:3478",
            "--ice-server",
            "turns:turn.example.org:5349",
            "--ice-username",
            "alice",
            "--ice-credential",
            "s3cret",
        ]);
        let settings = args.rtc_settings().unwrap();
        assert_eq!(
            settings.ice_servers,
            vec![
                IceServer::new("stun:stun.example.org:3478"),
                IceServer::new("turns:turn.example.org:5349").with_credentials("alice", "s3cret"),
            ]
        );
    }

    #[test]
    fn test_turn_server_without_credentials_rejected() {
        let args = connect_args(&["roomdrop", "peers", "--ice-server", "turn:turn.example.org"]);
        assert_err!(args.rtc_settings());
    }
}

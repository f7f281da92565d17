//! Signaling and relay server
//!
//! One task per socket. Each task joins its peer to a room, starts the
//! peer's heartbeat, then pumps frames in both directions until the socket
//! closes, the peer disconnects, or it is evicted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{DisplayNameInfo, PeerInfo, ServerMessage};

use super::error::NetworkError;
use super::grouping::{client_addr, resolve_room_key, GroupingMode};
use super::handshake::UpgradeRequest;
use super::liveness::{spawn_liveness, LivenessTarget, DEFAULT_HEARTBEAT_INTERVAL};
use super::registry::{PeerHandle, PeerRecord, RoomRegistry};
use super::relay::{dispatch_binary, dispatch_text, PeerContext, RelayOutcome};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How peers are grouped into rooms
    pub grouping: GroupingMode,
    /// Interval between pings; peers silent for twice this are evicted
    pub heartbeat_interval: Duration,
    /// How long a clean shutdown waits for connected peers
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grouping: GroupingMode::SameSegment,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Why the server stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Operator asked for a clean shutdown
    Shutdown,
    /// A peer asked for an immediate restart
    Restart,
}

struct Shared {
    registry: Arc<RoomRegistry>,
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    lifecycle: mpsc::UnboundedSender<ServerExit>,
}

/// Signaling server state
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
}

impl SignalingServer {
    /// Create a new signaling server
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            config,
            tls: None,
        }
    }

    /// Serve `wss://` instead of `ws://`
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Room registry shared by all connections
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Bind `addr` and serve until `shutdown` resolves or a peer asks for a restart
    pub async fn run<F>(&self, addr: &str, shutdown: F) -> Result<ServerExit, NetworkError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Signaling server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<ServerExit, NetworkError>
    where
        F: Future<Output = ()>,
    {
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: self.registry.clone(),
            config: self.config.clone(),
            tls: self.tls.clone(),
            lifecycle: lifecycle_tx,
        });
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break ServerExit::Shutdown,
                Some(exit) = lifecycle_rx.recv() => break exit,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New signaling connection from {}", peer_addr);
                        connections.spawn(serve_connection(stream, peer_addr, shared.clone()));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        drop(listener);
        match exit {
            ServerExit::Restart => {
                warn!("Restart requested, dropping {} connections", connections.len());
                connections.abort_all();
            }
            ServerExit::Shutdown => {
                info!("Shutting down, waiting for {} connections", connections.len());
                let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                    while connections.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!("Grace period over, closing remaining connections");
                    connections.abort_all();
                }
            }
        }
        Ok(exit)
    }
}

async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<Shared>) {
    let result = match &shared.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => handle_socket(tls_stream, peer_addr, &shared).await,
            Err(e) => {
                warn!("TLS handshake failed for {}: {}", peer_addr, e);
                return;
            }
        },
        None => handle_socket(stream, peer_addr, &shared).await,
    };

    if let Err(e) = result {
        warn!("Connection error for {}: {}", peer_addr, e);
    }
}

/// Handle a single WebSocket connection
async fn handle_socket<S>(stream: S, peer_addr: SocketAddr, shared: &Shared) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upgrade = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, mut response: Response| {
        upgrade = Some(UpgradeRequest::accept(request, &mut response));
        Ok::<Response, ErrorResponse>(response)
    })
    .await?;
    let upgrade = upgrade
        .ok_or_else(|| NetworkError::SignalingError("Upgrade without request".to_string()))?;

    let registry = &shared.registry;
    let addr = client_addr(upgrade.forwarded_for.as_deref(), peer_addr.ip());
    let room_key = resolve_room_key(shared.config.grouping, addr, upgrade.room.as_deref());
    let session = registry.next_session();
    let identity = upgrade.identity.clone();
    let name = upgrade.display_metadata();

    let (tx, mut outbound) = mpsc::unbounded_channel();
    let handle = PeerHandle::new(session, tx);
    let info = PeerInfo {
        id: identity.clone(),
        name: name.clone(),
        rtc_supported: upgrade.rtc_supported,
    };

    let existing = registry.join(&room_key, PeerRecord::new(info, addr, handle.clone()));
    handle.send(&ServerMessage::Peers { peers: existing });
    handle.send(&ServerMessage::DisplayName {
        message: DisplayNameInfo {
            display_name: name.display_name,
            device_name: name.device_name,
            peer_id: Some(identity.clone()),
        },
    });

    let liveness = spawn_liveness(
        registry.clone(),
        LivenessTarget {
            room_key: room_key.clone(),
            identity: identity.clone(),
            handle: handle.clone(),
        },
        shared.config.heartbeat_interval,
    );

    let ctx = PeerContext {
        room_key,
        identity,
        session,
    };
    let (mut write, mut read) = ws_stream.split();

    let outcome = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match dispatch_text(registry, &ctx, &text) {
                            RelayOutcome::Continue => {}
                            other => break other,
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        dispatch_binary(registry, &ctx, &data);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break RelayOutcome::Disconnect;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", ctx.identity, e);
                        break RelayOutcome::Disconnect;
                    }
                    _ => {}
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(Message::Close(close)) => {
                        let _ = write.send(Message::Close(close)).await;
                        break RelayOutcome::Disconnect;
                    }
                    Some(frame) => {
                        if let Err(e) = write.send(frame).await {
                            warn!("Send to {} failed: {}", ctx.identity, e);
                            break RelayOutcome::Disconnect;
                        }
                    }
                    None => break RelayOutcome::Disconnect,
                }
            }
        }
    };

    // Clean up on disconnect
    registry.leave(&ctx.room_key, &ctx.identity, ctx.session);
    liveness.abort();

    if outcome == RelayOutcome::Restart {
        let _ = shared.lifecycle.send(ServerExit::Restart);
    }
    Ok(())
}

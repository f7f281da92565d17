//! Signaling client
//!
//! Connects a peer to the signaling server on the capability-specific
//! endpoint and keeps its identity stable across reconnects by replaying the
//! `peerid` cookie the server issued.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::error::NetworkError;
use super::handshake::{peer_id_from_cookie, FALLBACK_PATH, PEER_ID_COOKIE, WEBRTC_PATH};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Whether this peer can open direct channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    DirectChannel,
    RelayOnly,
}

impl Capability {
    fn path(self) -> &'static str {
        match self {
            Capability::DirectChannel => WEBRTC_PATH,
            Capability::RelayOnly => FALLBACK_PATH,
        }
    }

    pub fn supports_direct(self) -> bool {
        matches!(self, Capability::DirectChannel)
    }
}

/// Parameters of a signaling connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub capability: Capability,
    /// Previously chosen display name
    pub display_name: Option<String>,
    /// Explicit room identifier
    pub room: Option<String>,
    /// Identity issued on an earlier connection
    pub identity: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            capability: Capability::DirectChannel,
            display_name: None,
            room: None,
            identity: None,
        }
    }
}

/// Signaling client for connecting to a signaling server
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    /// Create a new signaling client for a base URL such as `ws://host:3000`
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Full endpoint URL for the given options
    pub fn endpoint(&self, options: &ConnectOptions) -> Result<Url, NetworkError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| NetworkError::SignalingError(format!("Invalid server URL: {}", e)))?;

        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, options.capability.path()));

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            if let Some(name) = &options.display_name {
                query.append_pair("lastDisplayName", name);
            }
            if let Some(room) = &options.room {
                query.append_pair("room", room);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Connect to the signaling server
    pub async fn connect(&self, options: &ConnectOptions) -> Result<SignalingConnection, NetworkError> {
        let url = self.endpoint(options)?;
        let mut request = url.as_str().into_client_request()?;

        let agent = concat!("roomdrop/", env!("CARGO_PKG_VERSION"));
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(agent));
        if let Some(identity) = &options.identity {
            let cookie = HeaderValue::from_str(&format!("{}={}", PEER_ID_COOKIE, identity))
                .map_err(|e| NetworkError::SignalingError(format!("Invalid identity: {}", e)))?;
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;

        let issued = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(peer_id_from_cookie);
        let identity = issued.or_else(|| options.identity.clone());

        debug!("Connected to signaling server: {}", url);

        Ok(SignalingConnection {
            ws_stream,
            identity,
        })
    }
}

/// An active connection to the signaling server
pub struct SignalingConnection {
    ws_stream: WsStream,
    identity: Option<String>,
}

impl SignalingConnection {
    /// Identity the server knows this peer by
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Send a JSON message to the server
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), NetworkError> {
        let json = serde_json::to_string(msg)?;
        self.ws_stream.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Send a raw frame to the server
    pub async fn send_frame(&mut self, frame: Message) -> Result<(), NetworkError> {
        self.ws_stream.send(frame).await?;
        Ok(())
    }

    /// Receive the next text or binary frame
    pub async fn recv(&mut self) -> Result<Incoming, NetworkError> {
        next_incoming(&mut self.ws_stream).await
    }

    /// Receive the next JSON message, skipping binary frames
    pub async fn recv_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, NetworkError> {
        loop {
            if let Incoming::Text(text) = self.recv().await? {
                return Ok(serde_json::from_str(&text)?);
            }
        }
    }

    /// Split into a cloneable sender (backed by a writer task) and a receiver
    pub fn split(self) -> (SignalingSender, SignalingReceiver) {
        let (sink, stream) = self.ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(sink, rx));
        (
            SignalingSender { tx },
            SignalingReceiver {
                stream,
                identity: self.identity,
                writer,
            },
        )
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream.close(None).await?;
        Ok(())
    }
}

/// A frame received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
}

async fn next_incoming<S>(stream: &mut S) -> Result<Incoming, NetworkError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Incoming::Text(text)),
            Some(Ok(Message::Binary(data))) => return Ok(Incoming::Binary(data)),
            Some(Ok(Message::Close(_))) | None => {
                return Err(NetworkError::SignalingError("Connection closed".to_string()));
            }
            Some(Err(e)) => return Err(e.into()),
            _ => continue,
        }
    }
}

async fn run_writer(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            warn!("Signaling send failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}

/// Cloneable write side of a signaling connection
///
/// Sends are queued for the writer task and never block.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl SignalingSender {
    /// Queue a JSON message
    pub fn send<T: Serialize>(&self, msg: &T) -> Result<(), NetworkError> {
        let json = serde_json::to_string(msg)?;
        self.send_frame(Message::Text(json))
    }

    /// Queue a raw frame
    pub fn send_frame(&self, frame: Message) -> Result<(), NetworkError> {
        self.tx.send(frame).map_err(|_| NetworkError::NotConnected)
    }

    /// Queue a close frame
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    /// Sender wired to a plain channel, for driving components without a socket
    pub fn from_channel(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

/// Read side of a signaling connection
pub struct SignalingReceiver {
    stream: SplitStream<WsStream>,
    identity: Option<String>,
    writer: JoinHandle<()>,
}

impl SignalingReceiver {
    /// Identity the server knows this peer by
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Receive the next text or binary frame
    pub async fn recv(&mut self) -> Result<Incoming, NetworkError> {
        next_incoming(&mut self.stream).await
    }
}

impl Drop for SignalingReceiver {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

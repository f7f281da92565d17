//! WebSocket upgrade inspection
//!
//! Extracts what the core needs from the HTTP upgrade request: a stable
//! identity (from the `peerid` cookie, issued when absent), the direct-channel
//! capability encoded in the path, and the optional query parameters.

use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::{DisplayMetadata, MAX_IDENTITY_LEN};

/// Cookie carrying the peer identity
pub const PEER_ID_COOKIE: &str = "peerid";

/// Path suffix of direct-channel capable clients
pub const WEBRTC_PATH: &str = "/server/webrtc";

/// Path suffix of relay-only clients
pub const FALLBACK_PATH: &str = "/server/fallback";

const FORWARDED_FOR: &str = "x-forwarded-for";

const COLORS: &[&str] = &[
    "Amber", "Azure", "Coral", "Crimson", "Cyan", "Gold", "Indigo", "Ivory", "Jade", "Lime",
    "Magenta", "Maroon", "Olive", "Orange", "Pink", "Plum", "Rose", "Ruby", "Silver", "Teal",
];

const ANIMALS: &[&str] = &[
    "Badger", "Bat", "Bear", "Crane", "Dolphin", "Eagle", "Falcon", "Fox", "Gecko", "Heron",
    "Ibis", "Koala", "Lynx", "Marten", "Otter", "Owl", "Panda", "Raven", "Seal", "Wolf",
];

/// What the server learned from an upgrade request
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub identity: String,
    /// True when the identity was issued during this handshake
    pub issued: bool,
    pub rtc_supported: bool,
    pub last_display_name: Option<String>,
    pub room: Option<String>,
    pub forwarded_for: Option<String>,
    pub user_agent: Option<String>,
}

impl UpgradeRequest {
    /// Inspect the request and, when needed, issue an identity cookie on the response
    pub fn accept(request: &Request, response: &mut Response) -> Self {
        let headers = request.headers();
        let cookie_id = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(peer_id_from_cookie);

        let (identity, issued) = match cookie_id {
            Some(id) => (id, false),
            None => {
                let id = Uuid::new_v4().to_string();
                let cookie = format!("{}={}; SameSite=Strict", PEER_ID_COOKIE, id);
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        response.headers_mut().append(SET_COOKIE, value);
                    }
                    Err(e) => warn!("Failed to build identity cookie: {}", e),
                }
                (id, true)
            }
        };

        let mut upgrade = UpgradeRequest {
            identity,
            issued,
            rtc_supported: request.uri().path().contains("webrtc"),
            forwarded_for: header_str(request, FORWARDED_FOR),
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ..Default::default()
        };

        if let Some(query) = request.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                match key.as_ref() {
                    "lastDisplayName" => upgrade.last_display_name = Some(value.to_string()),
                    "room" => upgrade.room = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        upgrade
    }

    /// Display metadata for this peer
    pub fn display_metadata(&self) -> DisplayMetadata {
        DisplayMetadata {
            display_name: self
                .last_display_name
                .clone()
                .unwrap_or_else(|| display_name_for(&self.identity)),
            device_name: device_name(self.user_agent.as_deref()),
        }
    }
}

fn header_str(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Extract the identity from a `Cookie` header value
///
/// Identities too long for a routed chunk frame are ignored, so the peer
/// is issued a fresh one.
pub fn peer_id_from_cookie(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == PEER_ID_COOKIE && !value.is_empty() && value.len() <= MAX_IDENTITY_LEN)
            .then(|| value.to_string())
    })
}

/// Deterministic friendly name derived from an identity
pub fn display_name_for(identity: &str) -> String {
    let seed = string_hash(identity).unsigned_abs() as usize;
    let color = COLORS[seed % COLORS.len()];
    let animal = ANIMALS[(seed / COLORS.len()) % ANIMALS.len()];
    format!("{} {}", color, animal)
}

/// Product token of the user agent, or a generic label
fn device_name(user_agent: Option<&str>) -> String {
    user_agent
        .and_then(|ua| ua.split(['/', ' ']).next())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown Device".to_string())
}

/// 31-based rolling hash over UTF-16 code units, wrapping at 32 bits
fn string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

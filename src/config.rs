//! Configuration management for peerlink-core

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::path::Path;

use crate::session::SessionError;

use base64::Engine as _;

/// Well-known label of the default outbound data channel.
pub const DEFAULT_CHANNEL_LABEL: &str = "ion-sfu";

/// A single ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs, e.g. "stun:stun.example.org:3478"
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub credential: Option<String>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Explicit ICE server list; used verbatim when no STUN/TURN shorthand
    /// fields are set
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// STUN server host (shorthand, combined with `stun_port`)
    #[serde(default)]
    pub stun_host: String,

    #[serde(default)]
    pub stun_port: u16,

    /// TURN server host (shorthand)
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// "udp" or "tcp"; empty means udp
    #[serde(default)]
    pub turn_protocol: String,

    /// Use turns: scheme
    #[serde(default)]
    pub turn_tls: bool,

    /// Static TURN credentials
    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// TURN REST shared secret; when set, ephemeral credentials are derived
    /// per session instead of using the static pair
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Label of the data channel the Initiator opens at session creation
    #[serde(default = "default_channel_label")]
    pub default_channel_label: String,
}

fn default_turn_port() -> u16 {
    3478
}

fn default_channel_label() -> String {
    DEFAULT_CHANNEL_LABEL.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            stun_host: String::new(),
            stun_port: 0,
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: String::new(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
            default_channel_label: default_channel_label(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SessionError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&raw)
            .map_err(|e| SessionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Resolve the ICE server list handed to the engine.
    ///
    /// STUN/TURN shorthand fields take precedence; the explicit `ice_servers`
    /// list is the fallback. TURN credentials come from the shared secret
    /// (time-limited, HMAC-SHA1 per the TURN REST convention) when one is
    /// configured, otherwise from the static username/password pair.
    pub fn effective_ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = Vec::new();

        let has_stun = !self.stun_host.is_empty() && self.stun_port != 0;
        if has_stun {
            servers.push(IceServerConfig {
                urls: vec![format!("stun:{}:{}", self.stun_host, self.stun_port)],
                username: None,
                credential: None,
            });
        }

        if !self.turn_host.is_empty() {
            let scheme = if self.turn_tls { "turns" } else { "turn" };
            let transport = if self.turn_protocol.is_empty() {
                "udp"
            } else {
                self.turn_protocol.as_str()
            };
            let url = format!(
                "{}:{}:{}?transport={}",
                scheme, self.turn_host, self.turn_port, transport
            );

            let (username, credential) = if !self.turn_shared_secret.is_empty() {
                let ttl_secs: u64 = 24 * 60 * 60;
                let expiry = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() + ttl_secs)
                    .unwrap_or(ttl_secs);
                let user = format!("{}:peerlink", expiry);
                let password = hmac_sha1_base64(&self.turn_shared_secret, &user);
                (Some(user), Some(password))
            } else if !self.turn_username.is_empty() && !self.turn_password.is_empty() {
                (Some(self.turn_username.clone()), Some(self.turn_password.clone()))
            } else {
                (None, None)
            };

            servers.push(IceServerConfig {
                urls: vec![url],
                username,
                credential,
            });
        }

        if servers.is_empty() {
            return self.ice_servers.clone();
        }

        servers
    }
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}

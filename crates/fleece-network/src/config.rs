use std::env;
use std::time::Duration;

use fleece_proto::{IceServerConfig, WorkerId};
use url::Url;

use crate::error::NetworkError;

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Settings for one worker's [`crate::Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Unique id of this worker. Only used for identification.
    pub worker_id: WorkerId,
    /// Relay base url; `/register` is appended when connecting.
    pub signaling_url: String,
    /// Handed verbatim to the transport provider for every new link.
    pub ice_servers: Vec<IceServerConfig>,
    /// Delay before re-dialing the relay after the session drops.
    pub reconnect_backoff: Duration,
}

impl PeerConfig {
    pub fn new(worker_id: impl Into<WorkerId>, signaling_url: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            signaling_url: signaling_url.into(),
            ice_servers: vec![IceServerConfig::new(DEFAULT_STUN_SERVER)],
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn add_ice_server(mut self, server: IceServerConfig) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Reads `FLEECE_WORKER_ID`, `FLEECE_SIGNALING_URL`, `FLEECE_ICE_SERVERS`
    /// (comma separated `url` or `url|username|credential` entries; empty for
    /// host candidates only) and `FLEECE_RECONNECT_BACKOFF_MS`.
    pub fn from_env() -> Result<Self, NetworkError> {
        let worker_id = env::var("FLEECE_WORKER_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| NetworkError::Config("FLEECE_WORKER_ID must be set".into()))?;
        let signaling_url = env::var("FLEECE_SIGNALING_URL")
            .unwrap_or_else(|_| "ws://localhost:8765".to_string());
        let mut config = Self::new(worker_id, signaling_url);
        if let Ok(raw) = env::var("FLEECE_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&raw);
        }
        if let Ok(raw) = env::var("FLEECE_RECONNECT_BACKOFF_MS") {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                NetworkError::Config(format!("FLEECE_RECONNECT_BACKOFF_MS is not a number: {raw}"))
            })?;
            config.reconnect_backoff = Duration::from_millis(millis);
        }
        Ok(config)
    }

    /// Websocket endpoint of the relay's registration route.
    pub fn register_url(&self) -> Result<Url, NetworkError> {
        let base = self.signaling_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(NetworkError::Config("signaling url cannot be empty".into()));
        }
        let base = if base.contains("://") {
            base.to_string()
        } else {
            format!("{}{}", infer_scheme(base), base)
        };
        Url::parse(&format!("{base}/register"))
            .map_err(|err| NetworkError::Config(format!("invalid signaling url: {err}")))
    }
}

fn parse_ice_servers(raw: &str) -> Vec<IceServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, '|');
            let url = parts.next().unwrap_or_default();
            let mut server = IceServerConfig::new(url);
            server.username = parts.next().map(str::to_string);
            server.credential = parts.next().map(str::to_string);
            server
        })
        .collect()
}

fn infer_scheme(base: &str) -> &'static str {
    let host = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base)
        .to_ascii_lowercase();
    if host.starts_with("localhost")
        || host.starts_with("127.")
        || host.starts_with("0.0.0.0")
        || host == "::1"
    {
        "ws://"
    } else {
        "wss://"
    }
}

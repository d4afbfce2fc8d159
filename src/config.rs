use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Parser, Debug, Clone)]
#[command(name = "meshroom", about = "Room directory and signaling relay for browser peer meshes")]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    #[arg(long, env = "MESHROOM_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Directory served for every path that is not a route
    #[arg(long, env = "MESHROOM_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// STUN server handed to participants
    #[arg(long, env = "MESHROOM_STUN_URL", default_value = DEFAULT_STUN_URL)]
    pub stun_url: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long = "log-level", env = "MESHROOM_LOG", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn ice(&self) -> IceConfig {
        IceConfig::stun(&self.stun_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

/// Traversal configuration: one STUN server, no TURN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

impl IceConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            ice_servers: vec![IceServer { urls: url.into() }],
        }
    }

    pub fn stun_url(&self) -> Option<&str> {
        self.ice_servers.first().map(|s| s.urls.as_str())
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::stun(DEFAULT_STUN_URL)
    }
}

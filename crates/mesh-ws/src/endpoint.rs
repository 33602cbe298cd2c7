//! Connection target resolution.
//!
//! Hosts may carry a `ws://` or `wss://` prefix; the prefix selects the
//! default port and whether TLS is required. No further URL parsing is done:
//! host and path arrive already split.

use crate::error::{Result, WsError};

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Where a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

impl Endpoint {
    /// Strip the scheme prefix from `host` and fill in defaults.
    ///
    /// `port` overrides the scheme's default port. An empty path becomes `/`.
    pub fn resolve(host: &str, port: Option<u16>, path: &str) -> Result<Endpoint> {
        let (secure, bare) = if let Some(rest) = host.strip_prefix("wss://") {
            (true, rest)
        } else if let Some(rest) = host.strip_prefix("ws://") {
            (false, rest)
        } else if host.contains("://") {
            return Err(WsError::Configuration(format!("unsupported scheme in {}", host)));
        } else {
            (false, host)
        };

        let bare = bare.trim_end_matches('/');
        if bare.is_empty() {
            return Err(WsError::Configuration("empty host".to_string()));
        }

        let default_port = if secure { DEFAULT_SECURE_PORT } else { DEFAULT_PORT };
        let path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Ok(Endpoint {
            host: bare.to_string(),
            port: port.unwrap_or(default_port),
            path,
            secure,
        })
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { DEFAULT_SECURE_PORT } else { DEFAULT_PORT };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

//! HTTP server configuration settings.

use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Host the server binds to. Anything other than loopback logs a
    /// security warning: the gateway is single-tenant and unauthenticated.
    pub bind_host: String,
    /// Port the server binds to.
    pub bind_port: u16,
    /// Whether to probe the backend once during startup.
    pub health_check_on_startup: bool,
}

impl ServerConfig {
    /// Whether the configured bind host is a loopback address.
    pub fn is_loopback(&self) -> bool {
        self.bind_host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(self.bind_host == "localhost")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8000,
            health_check_on_startup: true,
        }
    }
}

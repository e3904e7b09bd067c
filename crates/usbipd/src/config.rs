use std::net::SocketAddr;

use anyhow::{Context, Result};

/// 3240 is the IANA-registered usbip port.
const DEFAULT_BIND: &str = "0.0.0.0:3240";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Concurrent client connections; `0` disables the cap.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.parse().expect("default bind address"),
            max_connections: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("USBIPD_BIND") {
            config.bind_addr = raw
                .parse()
                .with_context(|| format!("invalid USBIPD_BIND value {raw:?}"))?;
        }
        if let Ok(raw) = std::env::var("USBIPD_MAX_CONNECTIONS") {
            config.max_connections = raw
                .parse()
                .with_context(|| format!("invalid USBIPD_MAX_CONNECTIONS value {raw:?}"))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_the_usbip_port() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 3240);
        assert_eq!(config.max_connections, 8);
    }
}

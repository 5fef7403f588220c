//! API Configuration Module
//!
//! Settings for the HTTP surface: bind address, CORS, the realtime channel,
//! the ingest token and the store backend. Loaded from `RFIDGATE_*`
//! environment variables with development-friendly defaults. Pipeline
//! tunables live in `rfidgate_core::RfidConfig`.

use std::net::SocketAddr;
use std::time::Duration;

// ============================================================================
// STORE BACKEND
// ============================================================================

/// Which record store the server runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local store; state is lost on restart.
    #[default]
    Memory,
    Postgres,
}

impl StoreBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" | "inmemory" => Some(StoreBackend::Memory),
            "postgres" | "postgresql" | "pg" => Some(StoreBackend::Postgres),
            _ => None,
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,

    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins.
    /// Example: "https://erp.example.com,*.example.com"
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    /// Buffered realtime events per WebSocket subscriber before it lags.
    pub realtime_capacity: usize,

    /// Shared secret for ingest routes. `None` restricts them to loopback.
    pub ingest_token: Option<String>,

    pub request_timeout: Duration,

    pub store: StoreBackend,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            cors_origins: Vec::new(),
            cors_max_age_secs: 86400,
            realtime_capacity: 1024,
            ingest_token: None,
            request_timeout: Duration::from_secs(30),
            store: StoreBackend::Memory,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `RFIDGATE_HOST` / `RFIDGATE_PORT`: bind address (default: 0.0.0.0:8787)
    /// - `RFIDGATE_CORS_ORIGINS`: comma-separated allowed origins (empty = allow all)
    /// - `RFIDGATE_CORS_MAX_AGE_SECS`: preflight cache duration (default: 86400)
    /// - `RFIDGATE_REALTIME_CAPACITY`: per-subscriber buffer (default: 1024)
    /// - `RFIDGATE_INGEST_TOKEN`: ingest shared secret (default: unset, loopback only)
    /// - `RFIDGATE_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 30)
    /// - `RFIDGATE_STORE`: `memory` or `postgres` (default: memory)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("RFIDGATE_HOST")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.host);

        let port = std::env::var("RFIDGATE_PORT")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.port);

        let cors_origins = std::env::var("RFIDGATE_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cors_max_age_secs = std::env::var("RFIDGATE_CORS_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cors_max_age_secs);

        let realtime_capacity = std::env::var("RFIDGATE_REALTIME_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .map(|n| n.clamp(16, 65536))
            .unwrap_or(defaults.realtime_capacity);

        let ingest_token = std::env::var("RFIDGATE_INGEST_TOKEN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let request_timeout = std::env::var("RFIDGATE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs.clamp(1, 600)))
            .unwrap_or(defaults.request_timeout);

        let store = std::env::var("RFIDGATE_STORE")
            .ok()
            .and_then(|s| StoreBackend::parse(&s))
            .unwrap_or_default();

        Self {
            host,
            port,
            cors_origins,
            cors_max_age_secs,
            realtime_capacity,
            ingest_token,
            request_timeout,
            store,
        }
    }

    /// Socket address to bind. Falls back to all interfaces when the host
    /// does not parse as an IP.
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origins.is_empty() {
            return true;
        }

        self.cors_origins.iter().any(|allowed| {
            if allowed == origin {
                return true;
            }
            // Wildcard subdomains: *.example.com
            if let Some(pattern) = allowed.strip_prefix("*.") {
                let host = origin
                    .strip_prefix("https://")
                    .or_else(|| origin.strip_prefix("http://"));
                if let Some(host) = host {
                    return host.ends_with(&format!(".{}", pattern));
                }
            }
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.port, 8787);
        assert_eq!(config.ingest_token, None);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.bind_addr(), SocketAddr::from(([0, 0, 0, 0], 8787)));
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!(StoreBackend::parse("Postgres"), Some(StoreBackend::Postgres));
        assert_eq!(StoreBackend::parse(" pg "), Some(StoreBackend::Postgres));
        assert_eq!(StoreBackend::parse("memory"), Some(StoreBackend::Memory));
        assert_eq!(StoreBackend::parse("redis"), None);
    }

    #[test]
    fn test_bind_addr_falls_back_on_hostname() {
        let config = ApiConfig {
            host: "localhost".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), SocketAddr::from(([0, 0, 0, 0], 9000)));
    }

    #[test]
    fn test_origin_allowed() {
        let mut config = ApiConfig::default();
        assert!(config.is_origin_allowed("http://localhost:3000"));

        config.cors_origins = vec![
            "https://erp.example.com".to_string(),
            "*.plant.example.com".to_string(),
        ];
        assert!(config.is_origin_allowed("https://erp.example.com"));
        assert!(config.is_origin_allowed("https://dock.plant.example.com"));
        assert!(config.is_origin_allowed("http://line2.plant.example.com"));
        assert!(!config.is_origin_allowed("https://evilplant.example.com"));
        assert!(!config.is_origin_allowed("https://evil.com"));
    }
}

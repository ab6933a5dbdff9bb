// Client configuration, with defaults and `PORTRPC_*` environment overrides.

use crate::error::ClientError;
use portrpc_core::DEFAULT_CHUNK_SIZE;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// URL of the streaming (WebSocket) endpoint
    pub stream_url: String,
    /// URL used once calls fall back to HTTP; `None` disables the fallback
    pub http_url: Option<String>,
    /// Size of outbound media chunks in bytes
    pub chunk_size: usize,
    /// Keepalive period on the streaming connection; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Timeout for a single HTTP exchange
    pub http_timeout: Duration,
    /// Ask the server to reload its environment on every call
    pub reload_env: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:3030/_/uplink".to_string(),
            http_url: Some("http://localhost:3030/_/call".to_string()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            heartbeat_interval: Some(Duration::from_secs(30)),
            http_timeout: Duration::from_secs(30),
            reload_env: false,
        }
    }
}

impl ClientConfig {
    pub fn new_with_urls(stream_url: &str, http_url: Option<&str>) -> Self {
        Self {
            stream_url: stream_url.to_string(),
            http_url: http_url.map(str::to_string),
            ..Default::default()
        }
    }

    /// Defaults overridden by `PORTRPC_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable lookup.
    ///
    /// Recognised variables: `PORTRPC_STREAM_URL`, `PORTRPC_HTTP_URL` (empty
    /// disables the fallback), `PORTRPC_CHUNK_SIZE`, `PORTRPC_HEARTBEAT_SECS`
    /// (0 disables heartbeats), `PORTRPC_HTTP_TIMEOUT_SECS` and
    /// `PORTRPC_RELOAD_ENV`.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let mut config = Self::default();

        if let Some(url) = get("PORTRPC_STREAM_URL") {
            config.stream_url = url;
        }
        if let Some(url) = get("PORTRPC_HTTP_URL") {
            config.http_url = (!url.trim().is_empty()).then_some(url);
        }
        if let Some(size) = get("PORTRPC_CHUNK_SIZE") {
            let size: usize = parse_var("PORTRPC_CHUNK_SIZE", &size)?;
            if size == 0 {
                return Err(ClientError::Config(
                    "PORTRPC_CHUNK_SIZE must be greater than zero".into(),
                ));
            }
            config.chunk_size = size;
        }
        if let Some(secs) = get("PORTRPC_HEARTBEAT_SECS") {
            let secs: u64 = parse_var("PORTRPC_HEARTBEAT_SECS", &secs)?;
            config.heartbeat_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("PORTRPC_HTTP_TIMEOUT_SECS") {
            config.http_timeout =
                Duration::from_secs(parse_var("PORTRPC_HTTP_TIMEOUT_SECS", &secs)?);
        }
        if let Some(flag) = get("PORTRPC_RELOAD_ENV") {
            config.reload_env = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(ClientError::Config(format!(
                        "PORTRPC_RELOAD_ENV: expected a boolean, got {:?}",
                        other
                    )))
                }
            };
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ClientError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ClientError::Config(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = ClientConfig::from_vars(lookup(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.chunk_size, 65536);
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = ClientConfig::from_vars(lookup(&[
            ("PORTRPC_STREAM_URL", "ws://rpc.internal/ws"),
            ("PORTRPC_HTTP_URL", ""),
            ("PORTRPC_CHUNK_SIZE", "1024"),
            ("PORTRPC_HEARTBEAT_SECS", "0"),
            ("PORTRPC_HTTP_TIMEOUT_SECS", "5"),
            ("PORTRPC_RELOAD_ENV", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.stream_url, "ws://rpc.internal/ws");
        assert_eq!(config.http_url, None);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert!(config.reload_env);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("PORTRPC_CHUNK_SIZE", "lots")],
            [("PORTRPC_CHUNK_SIZE", "0")],
            [("PORTRPC_RELOAD_ENV", "maybe")],
        ] {
            assert!(matches!(
                ClientConfig::from_vars(lookup(&vars)),
                Err(ClientError::Config(_))
            ));
        }
    }

    #[test]
    fn test_new_with_urls() {
        let config = ClientConfig::new_with_urls("ws://a", None);
        assert_eq!(config.stream_url, "ws://a");
        assert!(config.http_url.is_none());
    }
}

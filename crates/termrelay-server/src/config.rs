use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use libtermrelay::DEFAULT_MAX_BROWSE_BYTES;
use termrelay_protocol::DEFAULT_MAX_FRAME_BYTES;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP and WebSocket listener for browsers.
    pub web_listen: SocketAddr,
    /// Binary protocol listener for remote hosts and transfer connections.
    pub host_listen: SocketAddr,
    pub static_dir: PathBuf,
    /// Origins allowed to call the HTTP surface cross-origin. Empty means
    /// same-origin only; `"*"` allows any.
    pub allow_origins: Vec<String>,
    pub ping_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub max_frame_bytes: usize,
    /// Largest file or listing an app client may browse inline.
    pub max_browse_bytes: u64,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::parse(&contents)
                .with_context(|| format!("invalid config {}", config_path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.ping_interval_secs == 0 {
            anyhow::bail!("ping_interval_secs must be > 0");
        }
        if config.peer_timeout_secs <= config.ping_interval_secs {
            anyhow::bail!("peer_timeout_secs must exceed ping_interval_secs");
        }
        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TERMRELAY_CONFIG") {
            return PathBuf::from(path);
        }
        dirs_path().join("config.toml")
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            host_listen: SocketAddr::from(([0, 0, 0, 0], 4476)),
            static_dir: PathBuf::from("webapp"),
            allow_origins: Vec::new(),
            ping_interval_secs: 5,
            peer_timeout_secs: 15,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_browse_bytes: DEFAULT_MAX_BROWSE_BYTES,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("termrelay")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("termrelay")
    } else {
        PathBuf::from("/tmp/termrelay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.web_listen.port(), 8080);
        assert_eq!(config.host_listen.port(), 4476);
        assert_eq!(config.static_dir, PathBuf::from("webapp"));
        assert_eq!(config.ping_interval(), Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_browse_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn partial_file_overrides() {
        let config = ServerConfig::parse(
            r#"
            host_listen = "127.0.0.1:5000"
            static_dir = "/srv/webapp"
            allow_origins = ["http://localhost:3000"]
            max_browse_bytes = 65536
            "#,
        )
        .unwrap();
        assert_eq!(config.host_listen, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.web_listen.port(), 8080);
        assert_eq!(config.static_dir, PathBuf::from("/srv/webapp"));
        assert_eq!(config.allow_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.max_browse_bytes, 65536);
    }

    #[test]
    fn timeout_must_exceed_ping_interval() {
        assert!(ServerConfig::parse("ping_interval_secs = 5\npeer_timeout_secs = 5").is_err());
        assert!(ServerConfig::parse("ping_interval_secs = 0").is_err());
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(ServerConfig::parse(r#"web_listen = "nowhere""#).is_err());
    }
}

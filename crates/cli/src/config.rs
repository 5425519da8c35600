use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tradebot_brokers_crypto::BybitConfig;

/// Runtime configuration, loaded from a TOML file. Every key has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub exchange: BybitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Without one, stores are kept in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid config")
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind, "0.0.0.0:3000");
        assert_eq!(config.exchange.symbol, "BTCUSD");
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [database]
            url = "postgres://tradebot@localhost/tradebot"

            [exchange]
            base_url = "https://api-testnet.bybit.com"
            category = "linear"
            symbol = "ETHUSDT"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://tradebot@localhost/tradebot")
        );
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.exchange.category, "linear");
        assert_eq!(config.exchange.symbol, "ETHUSDT");
        assert_eq!(config.exchange.timeout_secs, 10);
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(Config::from_toml("[server]\nbind = 3000").is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/tradebot.toml"))).is_err());
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }
}

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Bus address the persistor answers on.
    pub address: String,
    #[serde(rename = "writeConcern")]
    pub write_concern_camel: Option<String>,
    /// Older spelling of `writeConcern`, still honoured after it.
    pub write_concern: Option<String>,
    pub max_message_bytes: usize,
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:25017".to_string(),
            address: "docbus.persistor".to_string(),
            write_concern_camel: None,
            write_concern: None,
            max_message_bytes: 48_000_000,
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendKind::Memory),
            "postgres" | "postgresql" | "pg" => Ok(BackendKind::Postgres),
            other => Err(Error::Msg(format!("unknown backend kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Full connection URL; when set it wins over host/port/seeds.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub seeds: Option<Vec<SeedAddr>>,
    pub db_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
    /// How long a request waits for a free pooled connection before failing.
    pub pool_wait_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub use_ssl: bool,
    pub tls_ca_file: Option<String>,
    pub read_preference: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            seeds: None,
            db_name: "default_db".to_string(),
            username: None,
            password: None,
            pool_size: 10,
            pool_wait_timeout_ms: 5_000,
            socket_timeout_ms: 60_000,
            use_ssl: false,
            tls_ca_file: None,
            read_preference: "primary".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Priority: explicit file (DOCBUS_CONFIG) or ./config.toml → env → defaults
        let path = std::env::var("DOCBUS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let mut cfg = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| Error::Msg(format!("Failed to parse {}: {}", path, e)))?,
            Err(_) => Config::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("DOCBUS_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(address) = std::env::var("DOCBUS_ADDRESS") {
            self.address = address;
        }
        if let Ok(kind) = std::env::var("DOCBUS_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Ok(url) = std::env::var("DOCBUS_POSTGRES_URL") {
            self.backend.url = Some(url);
            self.backend.kind = BackendKind::Postgres;
        }
        if let Ok(db) = std::env::var("DOCBUS_DB_NAME") {
            self.backend.db_name = db;
        }
        if let Ok(wc) = std::env::var("DOCBUS_WRITE_CONCERN") {
            self.write_concern_camel = Some(wc);
        }
        Ok(())
    }

    /// Configured write concern names in the order they are consulted.
    pub fn write_concern_candidates(&self) -> Vec<String> {
        [&self.write_concern_camel, &self.write_concern]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_table_and_both_write_concern_spellings() {
        let cfg: Config = toml::from_str(
            r#"
            address = "app.persistor"
            writeConcern = "majority"
            write_concern = "safe"

            [backend]
            kind = "postgres"
            db_name = "app"
            seeds = [{ host = "a", port = 5432 }, { host = "b", port = 5433 }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.address, "app.persistor");
        assert_eq!(cfg.backend.kind, BackendKind::Postgres);
        assert_eq!(cfg.backend.seeds.as_ref().map(|s| s.len()), Some(2));
        assert_eq!(cfg.backend.pool_size, 10);
        assert_eq!(cfg.backend.pool_wait_timeout_ms, 5_000);
        assert_eq!(cfg.write_concern_candidates(), vec!["majority".to_string(), "safe".to_string()]);
    }

    #[test]
    fn defaults_use_memory_backend() {
        let cfg = Config::default();
        assert_eq!(cfg.backend.kind, BackendKind::Memory);
        assert!(cfg.write_concern_candidates().is_empty());
        assert_eq!("PG".parse::<BackendKind>().unwrap(), BackendKind::Postgres);
        assert!("oracle".parse::<BackendKind>().is_err());
    }
}

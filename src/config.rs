//! Server configuration: a YAML file with env-var fallbacks, read once
//! at boot. Validation failures are fatal (exit code 1) — the server
//! refuses to start with no JWT secret or an empty agent-token store.

use std::path::PathBuf;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{FleetError, Result};

pub const DEFAULT_RETENTION_HOURS: u64 = 7 * 24;
pub const DEFAULT_AGG_RETENTION_HOURS: u64 = 90 * 24;
pub const DEFAULT_MAX_QUERY_POINTS: usize = 720;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

#[derive(Clone, Debug, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Accepted agent API tokens. Entries are either sha256 hex digests
    /// or raw tokens (hashed at load); the handshake always compares
    /// digest to digest.
    #[serde(default)]
    pub agent_tokens: Vec<String>,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_agg_retention_hours")]
    pub aggregate_retention_hours: u64,
    #[serde(default = "default_max_query_points")]
    pub max_query_points: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Grace period for background loops to exit on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_retention_hours() -> u64 {
    DEFAULT_RETENTION_HOURS
}

fn default_agg_retention_hours() -> u64 {
    DEFAULT_AGG_RETENTION_HOURS
}

fn default_max_query_points() -> usize {
    DEFAULT_MAX_QUERY_POINTS
}

fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_QUEUE
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_url: None,
            jwt_secret: None,
            agent_tokens: Vec::new(),
            retention_hours: DEFAULT_RETENTION_HOURS,
            aggregate_retention_hours: DEFAULT_AGG_RETENTION_HOURS,
            max_query_points: DEFAULT_MAX_QUERY_POINTS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            shutdown_grace_secs: 10,
        }
    }
}

impl FleetConfig {
    /// Read the config file (FLEET_CONFIG override, then common
    /// relative locations), then layer env fallbacks on top.
    pub async fn load() -> Result<Self> {
        let mut cfg = match read_config_file().await {
            Some((path, raw)) => {
                tracing::info!("loaded config from {}", path.display());
                serde_yaml::from_str(&raw)
                    .map_err(|err| FleetError::FatalConfig(format!("parsing config: {err}")))?
            }
            None => FleetConfig::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("FLEET_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(secret) = std::env::var("FLEET_JWT_SECRET") {
            self.jwt_secret = Some(secret);
        }
        if let Ok(tokens) = std::env::var("FLEET_AGENT_TOKENS") {
            self.agent_tokens = tokens
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
    }

    /// Boot-time validation. Every failure here maps to exit code 1.
    pub fn validate(&self) -> Result<()> {
        match &self.jwt_secret {
            Some(secret) if !secret.trim().is_empty() => {}
            _ => {
                return Err(FleetError::FatalConfig(
                    "jwt_secret is missing or empty (set FLEET_JWT_SECRET)".to_string(),
                ));
            }
        }
        if self.agent_tokens.is_empty() {
            return Err(FleetError::FatalConfig(
                "agent token store is empty (set agent_tokens or FLEET_AGENT_TOKENS)".to_string(),
            ));
        }
        if self.database_url.as_deref().unwrap_or("").is_empty() {
            return Err(FleetError::FatalConfig(
                "database_url is missing (set DATABASE_URL)".to_string(),
            ));
        }
        Ok(())
    }

    /// Accepted token digests: entries that already look like sha256
    /// hex are kept as-is, raw tokens are hashed.
    pub fn token_digests(&self) -> Vec<String> {
        self.agent_tokens
            .iter()
            .map(|t| {
                let t = t.trim();
                if t.len() == 64 && t.chars().all(|c| c.is_ascii_hexdigit()) {
                    t.to_lowercase()
                } else {
                    hash_token(t)
                }
            })
            .collect()
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

async fn read_config_file() -> Option<(PathBuf, String)> {
    let candidates = if let Ok(p) = std::env::var("FLEET_CONFIG") {
        vec![PathBuf::from(p)]
    } else {
        vec![PathBuf::from("fleet.yaml"), PathBuf::from("../fleet.yaml")]
    };

    for path in candidates {
        if let Ok(raw) = tokio::fs::read_to_string(&path).await {
            return Some((path, raw));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> FleetConfig {
        FleetConfig {
            database_url: Some("postgres://localhost/fleet".into()),
            jwt_secret: Some("s3cret".into()),
            agent_tokens: vec!["token-a".into()],
            ..FleetConfig::default()
        }
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_jwt_secret_is_fatal() {
        let cfg = FleetConfig { jwt_secret: None, ..valid() };
        assert!(matches!(cfg.validate(), Err(FleetError::FatalConfig(_))));

        let cfg = FleetConfig { jwt_secret: Some("  ".into()), ..valid() };
        assert!(matches!(cfg.validate(), Err(FleetError::FatalConfig(_))));
    }

    #[test]
    fn empty_token_store_is_fatal() {
        let cfg = FleetConfig { agent_tokens: vec![], ..valid() };
        assert!(matches!(cfg.validate(), Err(FleetError::FatalConfig(_))));
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let cfg = FleetConfig { database_url: None, ..valid() };
        assert!(matches!(cfg.validate(), Err(FleetError::FatalConfig(_))));
    }

    #[test]
    fn raw_tokens_are_hashed_and_digests_kept() {
        let digest = hash_token("token-a");
        let cfg = FleetConfig {
            agent_tokens: vec!["token-a".into(), digest.clone()],
            ..valid()
        };
        let digests = cfg.token_digests();
        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0], digest);
        assert_eq!(digests[1], digest);
    }

    #[test]
    fn yaml_parses_with_defaults() {
        let cfg: FleetConfig = serde_yaml::from_str(
            "database_url: postgres://localhost/fleet\njwt_secret: abc\nagent_tokens: [t]\n",
        )
        .unwrap();
        assert_eq!(cfg.retention_hours, DEFAULT_RETENTION_HOURS);
        assert_eq!(cfg.max_query_points, DEFAULT_MAX_QUERY_POINTS);
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    }
}

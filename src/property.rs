//! Property store: a single JSON-valued KV table behind an in-process
//! cache. Reads go through the cache (per-entry expiry, default 1 h);
//! writes go to the table and refresh the cached entry so readers on
//! other tasks see the new value on their next get. This store is the
//! sole mutator of the `properties` table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::notify::ChannelConfig;
use fleet_core::PublicIpConfig;

pub const KEY_NOTIFICATION_CHANNELS: &str = "notification_channels";
pub const KEY_SYSTEM_CONFIG: &str = "system_config";
pub const KEY_PUBLIC_IP_CONFIG: &str = "public_ip_config";
pub const KEY_ALERT_CONFIG: &str = "alert_config";
pub const KEY_DNS_PROVIDERS: &str = "dns_providers";
pub const KEY_AGENT_INSTALL_CONFIG: &str = "agent_install_config";
pub const KEY_VERSION: &str = "version";

pub const RESERVED_KEYS: [&str; 7] = [
    KEY_NOTIFICATION_CHANNELS,
    KEY_SYSTEM_CONFIG,
    KEY_PUBLIC_IP_CONFIG,
    KEY_ALERT_CONFIG,
    KEY_DNS_PROVIDERS,
    KEY_AGENT_INSTALL_CONFIG,
    KEY_VERSION,
];

const CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    loaded_at: Instant,
}

#[derive(Clone)]
pub struct PropertyStore {
    pool: PgPool,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl PropertyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl: CACHE_TTL,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(Some(entry.value.clone()));
                }
            }
        }

        let row: Option<(Value,)> =
            sqlx::query_as(r#"SELECT value FROM properties WHERE key = $1"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value,)) => {
                self.cache.write().await.insert(
                    key.to_string(),
                    CacheEntry { value: value.clone(), loaded_at: Instant::now() },
                );
                Ok(Some(value))
            }
            None => {
                self.cache.write().await.remove(key);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO properties (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
        "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), CacheEntry { value, loaded_at: Instant::now() });
        Ok(())
    }

    /// One-shot boot initializer: insert a default for every reserved
    /// key not yet present. Existing values are left alone.
    pub async fn init_defaults(&self) -> Result<()> {
        let mut inserted = 0u32;
        for key in RESERVED_KEYS {
            let res = sqlx::query(
                r#"INSERT INTO properties (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING"#,
            )
            .bind(key)
            .bind(default_value(key))
            .execute(&self.pool)
            .await?;
            inserted += res.rows_affected() as u32;
        }
        if inserted > 0 {
            info!(inserted, "initialized default properties");
        }
        Ok(())
    }

    // Typed accessors for the keys the pipelines consume. A corrupt or
    // missing record falls back to the default rather than stalling a
    // tick.

    pub async fn alert_config(&self) -> AlertConfig {
        match self.get(KEY_ALERT_CONFIG).await {
            Ok(Some(value)) => {
                serde_json::from_value(value).unwrap_or_else(|_| AlertConfig::default())
            }
            _ => AlertConfig::default(),
        }
    }

    pub async fn notification_channels(&self) -> Vec<ChannelConfig> {
        match self.get(KEY_NOTIFICATION_CHANNELS).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub async fn public_ip_config(&self) -> PublicIpConfig {
        match self.get(KEY_PUBLIC_IP_CONFIG).await {
            Ok(Some(value)) => {
                serde_json::from_value(value).unwrap_or_else(|_| PublicIpConfig::default())
            }
            _ => PublicIpConfig::default(),
        }
    }

    /// Raw and aggregate retention in milliseconds. `system_config`
    /// may override the file config at runtime; absent keys fall back.
    pub async fn retention_ms(&self, cfg: &crate::config::FleetConfig) -> (i64, i64) {
        let system = self.get(KEY_SYSTEM_CONFIG).await.ok().flatten();
        retention_from_system_config(system.as_ref(), cfg)
    }
}

fn retention_from_system_config(
    system: Option<&Value>,
    cfg: &crate::config::FleetConfig,
) -> (i64, i64) {
    let hours = |key: &str, fallback: u64| -> i64 {
        let h = system
            .and_then(|v| v.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(fallback);
        (h as i64) * 3600 * 1000
    };
    (
        hours("retentionHours", cfg.retention_hours),
        hours("aggregateRetentionHours", cfg.aggregate_retention_hours),
    )
}

fn default_value(key: &str) -> Value {
    match key {
        KEY_NOTIFICATION_CHANNELS => json!([]),
        KEY_SYSTEM_CONFIG => json!({ "siteName": "Fleet", "customHead": "" }),
        KEY_PUBLIC_IP_CONFIG => {
            serde_json::to_value(PublicIpConfig::default()).unwrap_or(Value::Null)
        }
        KEY_ALERT_CONFIG => serde_json::to_value(AlertConfig::default()).unwrap_or(Value::Null),
        KEY_DNS_PROVIDERS => json!([]),
        KEY_AGENT_INSTALL_CONFIG => json!({}),
        KEY_VERSION => json!(env!("CARGO_PKG_VERSION")),
        _ => Value::Null,
    }
}

/// One threshold rule: fire after `value > threshold` has held for
/// `duration` seconds.
#[derive(Clone, Copy, Deserialize, serde::Serialize, Debug, PartialEq)]
pub struct ThresholdRule {
    pub enabled: bool,
    pub threshold: f64,
    pub duration: i64,
}

impl ThresholdRule {
    const fn new(enabled: bool, threshold: f64, duration: i64) -> Self {
        Self { enabled, threshold, duration }
    }
}

#[derive(Clone, Deserialize, serde::Serialize, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NotifyToggles {
    pub alert: bool,
    pub resolved: bool,
    pub ssh_login: bool,
    pub tamper: bool,
}

impl Default for NotifyToggles {
    fn default() -> Self {
        Self { alert: true, resolved: true, ssh_login: true, tamper: true }
    }
}

/// The global alert rule set, stored as one property record.
#[derive(Clone, Deserialize, serde::Serialize, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertConfig {
    pub cpu: ThresholdRule,
    pub memory: ThresholdRule,
    pub disk: ThresholdRule,
    /// Threshold in MB/s over rx+tx.
    pub network: ThresholdRule,
    /// Threshold in days left; the comparison is inverted.
    pub cert: ThresholdRule,
    /// Duration is the seconds a monitor must stay down.
    pub service: ThresholdRule,
    /// Threshold is the agent-offline window in seconds.
    pub offline: ThresholdRule,
    #[serde(rename = "maskIP")]
    pub mask_ip: bool,
    pub notify: NotifyToggles,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cpu: ThresholdRule::new(true, 85.0, 300),
            memory: ThresholdRule::new(true, 90.0, 300),
            disk: ThresholdRule::new(true, 90.0, 600),
            network: ThresholdRule::new(true, 100.0, 300),
            cert: ThresholdRule::new(true, 14.0, 0),
            service: ThresholdRule::new(true, 0.0, 60),
            offline: ThresholdRule::new(true, 300.0, 0),
            mask_ip: false,
            notify: NotifyToggles::default(),
        }
    }
}

impl AlertConfig {
    /// Alert-scan period: a tenth of the offline window, clamped to
    /// [5 s, 60 s].
    pub fn scan_period_secs(&self) -> u64 {
        let tenth = (self.offline.threshold / 10.0) as u64;
        tenth.clamp(5, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_reserved_key() {
        for key in RESERVED_KEYS {
            assert!(!default_value(key).is_null(), "no default for {key}");
        }
    }

    #[test]
    fn alert_config_round_trip() {
        let cfg = AlertConfig::default();
        let value = serde_json::to_value(&cfg).unwrap();
        let back: AlertConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_alert_config_fills_defaults() {
        let cfg: AlertConfig = serde_json::from_value(json!({
            "cpu": { "enabled": false, "threshold": 50.0, "duration": 60 }
        }))
        .unwrap();
        assert!(!cfg.cpu.enabled);
        assert_eq!(cfg.cpu.threshold, 50.0);
        assert_eq!(cfg.memory, AlertConfig::default().memory);
        assert!(cfg.notify.alert);
    }

    #[test]
    fn retention_override_comes_from_system_config() {
        let cfg = crate::config::FleetConfig::default();
        let (raw, agg) = retention_from_system_config(None, &cfg);
        assert_eq!(raw, 7 * 24 * 3_600_000);
        assert_eq!(agg, 90 * 24 * 3_600_000);

        let system = json!({ "siteName": "Fleet", "retentionHours": 48 });
        let (raw, agg) = retention_from_system_config(Some(&system), &cfg);
        assert_eq!(raw, 48 * 3_600_000);
        assert_eq!(agg, 90 * 24 * 3_600_000);
    }

    #[test]
    fn scan_period_clamps() {
        let mut cfg = AlertConfig::default();
        cfg.offline.threshold = 300.0;
        assert_eq!(cfg.scan_period_secs(), 30);
        cfg.offline.threshold = 10.0;
        assert_eq!(cfg.scan_period_secs(), 5);
        cfg.offline.threshold = 100_000.0;
        assert_eq!(cfg.scan_period_secs(), 60);
    }
}

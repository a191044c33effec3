//! Row types and API views. `FromRow` structs mirror the persisted
//! schema; the serializable views are what the read API returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Clone, Serialize, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub last_addr: String,
    pub public_ip: Option<String>,
    pub status: String,
    pub last_seen_at: i64,
    pub visibility: String,
    pub tags: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-(agent, rule, type) alert state. `start_time > 0` means a
/// streak above threshold is in progress; `is_firing` implies
/// `last_record_id != 0`.
#[derive(Clone, FromRow, Debug)]
pub struct AlertStateRow {
    pub state_key: String,
    pub agent_id: String,
    pub value: f64,
    pub threshold: f64,
    pub duration_secs: i64,
    pub start_time: i64,
    pub last_check: i64,
    pub is_firing: bool,
    pub last_record_id: i64,
}

pub const ALERT_FIRING: &str = "firing";
pub const ALERT_RESOLVED: &str = "resolved";

#[derive(Clone, Serialize, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecordRow {
    pub id: i64,
    pub agent_id: String,
    pub alert_type: String,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub level: String,
    pub status: String,
    pub fired_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Clone, Serialize, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SshLoginRow {
    pub id: i64,
    pub agent_id: String,
    pub username: String,
    pub source_ip: String,
    pub success: bool,
    pub method: Option<String>,
    pub at: i64,
}

#[derive(Clone, Serialize, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditResultRow {
    pub id: i64,
    pub agent_id: String,
    pub path: String,
    pub change: String,
    pub detail: Option<String>,
    pub at: i64,
}

// --- Read API views ---

/// One `{timestamp, value}` point; the uniform projection both raw and
/// aggregate reads are shaped into.
#[derive(Clone, Copy, Serialize, Debug, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Clone, Serialize, Debug)]
pub struct Series {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::BTreeMap<String, String>>,
    pub data: Vec<SeriesPoint>,
}

#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub range: QueryRange,
    pub series: Vec<Series>,
}

#[derive(Clone, Copy, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QueryRange {
    pub start: i64,
    pub end: i64,
    pub interval_seconds: i64,
}

#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PagedRecords {
    pub total: i64,
    pub page_index: i64,
    pub page_size: i64,
    pub records: Vec<AlertRecordRow>,
}

#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub status: String,
    pub connected: bool,
    pub last_seen_at: i64,
    pub last_addr: String,
    pub public_ip: Option<String>,
    pub visibility: String,
}

impl AgentView {
    pub fn from_row(row: AgentRow, connected: bool) -> Self {
        Self {
            id: row.id,
            name: row.name,
            hostname: row.hostname,
            os: row.os,
            arch: row.arch,
            version: row.version,
            status: row.status,
            connected,
            last_seen_at: row.last_seen_at,
            last_addr: row.last_addr,
            public_ip: row.public_ip,
            visibility: row.visibility,
        }
    }
}

/// Tracked state of a pushed command, kept in memory until the agent
/// answers or the entry expires.
#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandState {
    pub id: uuid::Uuid,
    pub agent_id: String,
    pub command_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub issued_at: i64,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub page_index: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

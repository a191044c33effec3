//! Wire-protocol types shared between the headend and agent builds.
//! Keep this crate free of HTTP/SQL deps so both sides can reuse it.
//!
//! Every message on the agent channel is a [`Frame`]: a JSON object
//! with a `type` string and a `data` payload. Unknown fields inside
//! payloads are tolerated for forward compatibility; unknown `type`
//! values survive decoding and are rejected by the dispatcher, not
//! here. All timestamps are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope for every inbound and outbound message on the channel.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }

    /// Build a frame from a serializable payload. Serialization of the
    /// payload types in this crate cannot fail.
    pub fn from_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> Self {
        Self {
            kind: kind.into(),
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// The metric kinds an agent reports. Each maps to a raw table and an
/// aggregate table on the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Connections,
    DiskIo,
    Host,
    Gpu,
    Temperature,
    Monitor,
}

impl MetricKind {
    pub const ALL: [MetricKind; 10] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
        MetricKind::Connections,
        MetricKind::DiskIo,
        MetricKind::Host,
        MetricKind::Gpu,
        MetricKind::Temperature,
        MetricKind::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
            MetricKind::Connections => "connections",
            MetricKind::DiskIo => "disk_io",
            MetricKind::Host => "host",
            MetricKind::Gpu => "gpu",
            MetricKind::Temperature => "temperature",
            MetricKind::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<MetricKind> {
        MetricKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Frame type string for this kind, e.g. `metric:cpu`.
    pub fn frame_type(&self) -> String {
        format!("metric:{}", self.as_str())
    }
}

/// Frame type constants for the non-metric messages.
pub mod frame_type {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const COMMAND_RESPONSE: &str = "command_response";
    pub const SSH_LOGIN_EVENT: &str = "ssh_login_event";
    pub const TAMPER_EVENT: &str = "tamper_event";
    pub const PUBLIC_IP_CONFIG: &str = "public_ip_config";
    pub const COMMAND: &str = "command";
    pub const METRIC_PREFIX: &str = "metric:";
}

/// Authoritative identity refresh, sent by the agent on every connect.
/// `agent_id` is client-generated and stable across restarts and IP
/// changes.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Success,
    Error,
}

/// Agent reply to a previously pushed [`Command`].
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Fire-and-forget command pushed to an agent; the agent answers with
/// a [`CommandResponse`] carrying the same `id`.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Per-agent public-IP collection settings, fanned out by the server.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PublicIpConfig {
    pub enabled: bool,
    #[serde(rename = "intervalSeconds")]
    pub interval_seconds: u64,
    #[serde(rename = "ipv4Enabled")]
    pub ipv4_enabled: bool,
    #[serde(rename = "ipv6Enabled")]
    pub ipv6_enabled: bool,
    #[serde(default, rename = "ipv4APIs")]
    pub ipv4_apis: Vec<String>,
    #[serde(default, rename = "ipv6APIs")]
    pub ipv6_apis: Vec<String>,
}

impl Default for PublicIpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            ipv4_enabled: true,
            ipv6_enabled: true,
            ipv4_apis: vec![
                "https://api.ipify.org".to_string(),
                "https://ipv4.icanhazip.com".to_string(),
            ],
            ipv6_apis: vec![
                "https://api6.ipify.org".to_string(),
                "https://ipv6.icanhazip.com".to_string(),
            ],
        }
    }
}

// --- Metric payloads ---
//
// Scalar kinds carry one object; multi-partition kinds (disk, network,
// disk_io, gpu, temperature, monitor) carry an array with one element
// per mount / interface / device / sensor / monitor.

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CpuMetrics {
    pub usage_pct: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetrics {
    pub total_bytes: f64,
    pub used_bytes: f64,
    pub used_pct: f64,
    pub swap_total_bytes: f64,
    pub swap_used_bytes: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DiskMetrics {
    pub mount: String,
    pub total_bytes: f64,
    pub used_bytes: f64,
    pub used_pct: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub interface: String,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub tcp_count: f64,
    pub udp_count: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DiskIoMetrics {
    pub device: String,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub uptime_secs: f64,
    pub process_count: f64,
    #[serde(default)]
    pub public_ip: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GpuMetrics {
    pub device: String,
    pub usage_pct: f64,
    pub memory_total_bytes: f64,
    pub memory_used_bytes: f64,
    pub temperature_c: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureMetrics {
    pub sensor: String,
    pub celsius: f64,
}

/// Result of one agent-executed synthetic check. `checked_at` is the
/// probe-side time the check ran, and is the timestamp the server
/// stores (a check's timestamp must be the time it was performed).
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MonitorResult {
    pub monitor_id: String,
    pub monitor_type: String,
    pub target: String,
    pub up: bool,
    pub latency_ms: f64,
    #[serde(default)]
    pub cert_days_left: Option<f64>,
    pub checked_at: i64,
}

/// SSH-login capture forwarded to the notifier path.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SshLoginEvent {
    pub username: String,
    pub source_ip: String,
    pub success: bool,
    #[serde(default)]
    pub method: Option<String>,
    pub at: i64,
}

/// File-tampering capture forwarded to the notifier path.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TamperEvent {
    pub path: String,
    pub change: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::from_payload(
            frame_type::REGISTER,
            &Register {
                agent_id: "a1".into(),
                name: "web-1".into(),
                hostname: "web-1.internal".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                version: "1.4.0".into(),
            },
        );
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.kind, "register");
        let reg: Register = serde_json::from_value(decoded.data).unwrap();
        assert_eq!(reg.agent_id, "a1");
        assert_eq!(reg.hostname, "web-1.internal");
    }

    #[test]
    fn unknown_payload_fields_are_tolerated() {
        let raw = json!({
            "type": "metric:cpu",
            "data": { "usagePct": 42.5, "cores": 8, "futureField": true }
        })
        .to_string();
        let frame = Frame::decode(&raw).unwrap();
        let cpu: CpuMetrics = serde_json::from_value(frame.data).unwrap();
        assert_eq!(cpu.usage_pct, 42.5);
    }

    #[test]
    fn register_wire_keys_are_camel_case() {
        let frame = Frame::from_payload(
            frame_type::REGISTER,
            &Register {
                agent_id: "a1".into(),
                name: "web-1".into(),
                hostname: "web-1.internal".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                version: "1.4.0".into(),
            },
        );
        assert_eq!(frame.data.get("agentId").and_then(|v| v.as_str()), Some("a1"));
    }

    #[test]
    fn public_ip_config_wire_keys() {
        let value = serde_json::to_value(PublicIpConfig::default()).unwrap();
        assert!(value.get("intervalSeconds").is_some());
        assert!(value.get("ipv4APIs").is_some());
        assert!(value.get("ipv6Enabled").is_some());
    }

    #[test]
    fn unknown_type_survives_decoding() {
        let frame = Frame::decode(r#"{"type":"metric:quantum","data":{}}"#).unwrap();
        assert_eq!(frame.kind, "metric:quantum");
        assert!(MetricKind::parse("quantum").is_none());
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let frame = Frame::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame.kind, "heartbeat");
        assert!(frame.data.is_null());
    }

    #[test]
    fn metric_kind_name_round_trip() {
        for kind in MetricKind::ALL {
            assert_eq!(MetricKind::parse(kind.as_str()), Some(kind));
            assert!(kind.frame_type().starts_with(frame_type::METRIC_PREFIX));
        }
    }

    #[test]
    fn command_status_wire_names() {
        let resp: CommandResponse = serde_json::from_value(json!({
            "id": "7f4df5b2-7b86-4d3f-bb8e-7d9a3ba7e001",
            "type": "restart_service",
            "status": "success",
            "result": { "exitCode": 0 }
        }))
        .unwrap();
        assert_eq!(resp.status, CommandStatus::Success);
        assert!(resp.error.is_none());
    }

    #[test]
    fn monitor_result_keeps_probe_timestamp() {
        let m: MonitorResult = serde_json::from_value(json!({
            "monitorId": "m1",
            "monitorType": "https",
            "target": "https://example.com",
            "up": true,
            "latencyMs": 88.0,
            "certDaysLeft": 42.0,
            "checkedAt": 1714000000000i64
        }))
        .unwrap();
        assert_eq!(m.checked_at, 1_714_000_000_000);
        assert_eq!(m.cert_days_left, Some(42.0));
    }
}

//! Metric ingestion: decode a `metric:<kind>` frame and write raw
//! rows. Multi-partition kinds write one row per array element inside
//! a single transaction; a malformed element is logged and skipped
//! rather than failing the frame. The server stamps every row with its
//! own clock except synthetic-monitor results, which keep the probe's
//! `checked_at`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Postgres};
use tracing::warn;

use crate::error::{FleetError, Result};
use crate::metrics::{KindSpec, spec_for};
use fleet_core::{
    ConnectionMetrics, CpuMetrics, DiskIoMetrics, DiskMetrics, GpuMetrics, HostMetrics,
    MemoryMetrics, MetricKind, MonitorResult, NetworkMetrics, TemperatureMetrics,
};

pub async fn handle_metric(
    pool: &PgPool,
    agent_id: &str,
    kind: MetricKind,
    data: Value,
    now_ms: i64,
) -> Result<()> {
    let spec = spec_for(kind);
    match kind {
        MetricKind::Cpu => {
            let m: CpuMetrics = decode(data)?;
            insert_raw(pool, spec, agent_id, now_ms, None, &[Some(m.usage_pct)]).await?;
        }
        MetricKind::Memory => {
            let m: MemoryMetrics = decode(data)?;
            insert_raw(
                pool,
                spec,
                agent_id,
                now_ms,
                None,
                &[
                    Some(m.total_bytes),
                    Some(m.used_bytes),
                    Some(m.used_pct),
                    Some(m.swap_total_bytes),
                    Some(m.swap_used_bytes),
                ],
            )
            .await?;
        }
        MetricKind::Connections => {
            let m: ConnectionMetrics = decode(data)?;
            insert_raw(pool, spec, agent_id, now_ms, None, &[Some(m.tcp_count), Some(m.udp_count)])
                .await?;
        }
        MetricKind::Host => {
            let m: HostMetrics = decode(data)?;
            insert_raw(
                pool,
                spec,
                agent_id,
                now_ms,
                None,
                &[Some(m.uptime_secs), Some(m.process_count)],
            )
            .await?;
            if let Some(ip) = m.public_ip.as_deref() {
                if let Err(err) = crate::db::set_agent_public_ip(pool, agent_id, ip).await {
                    warn!(agent_id, "failed to record public ip: {err}");
                }
            }
        }
        MetricKind::Disk => {
            let rows: Vec<DiskMetrics> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (m.mount.clone(), now_ms, vec![Some(m.total_bytes), Some(m.used_bytes), Some(m.used_pct)])
            })
            .await?;
        }
        MetricKind::Network => {
            let rows: Vec<NetworkMetrics> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (m.interface.clone(), now_ms, vec![Some(m.rx_bytes_per_sec), Some(m.tx_bytes_per_sec)])
            })
            .await?;
        }
        MetricKind::DiskIo => {
            let rows: Vec<DiskIoMetrics> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (m.device.clone(), now_ms, vec![Some(m.read_bytes_per_sec), Some(m.write_bytes_per_sec)])
            })
            .await?;
        }
        MetricKind::Gpu => {
            let rows: Vec<GpuMetrics> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (
                    m.device.clone(),
                    now_ms,
                    vec![
                        Some(m.usage_pct),
                        Some(m.memory_total_bytes),
                        Some(m.memory_used_bytes),
                        Some(m.temperature_c),
                    ],
                )
            })
            .await?;
        }
        MetricKind::Temperature => {
            let rows: Vec<TemperatureMetrics> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (m.sensor.clone(), now_ms, vec![Some(m.celsius)])
            })
            .await?;
        }
        MetricKind::Monitor => {
            let rows: Vec<MonitorResult> = decode_elements(data, spec);
            insert_partitioned(pool, spec, agent_id, rows, |m| {
                (
                    m.monitor_id.clone(),
                    m.checked_at,
                    vec![
                        Some(if m.up { 1.0 } else { 0.0 }),
                        Some(m.latency_ms),
                        m.cert_days_left,
                    ],
                )
            })
            .await?;
        }
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|err| FleetError::BadInput(err.to_string()))
}

/// Decode an array payload element by element: a bad element is logged
/// and dropped, the rest of the frame survives.
fn decode_elements<T: DeserializeOwned>(data: Value, spec: &KindSpec) -> Vec<T> {
    let Value::Array(items) = data else {
        warn!(kind = spec.raw_table, "expected array payload, dropping frame");
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value(item) {
            Ok(m) => out.push(m),
            Err(err) => warn!(kind = spec.raw_table, "skipping malformed element: {err}"),
        }
    }
    out
}

/// All rows of one array frame go in one transaction.
async fn insert_partitioned<T>(
    pool: &PgPool,
    spec: &KindSpec,
    agent_id: &str,
    rows: Vec<T>,
    to_row: impl Fn(&T) -> (String, i64, Vec<Option<f64>>),
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for row in &rows {
        let (partition, ts, values) = to_row(row);
        insert_raw(&mut *tx, spec, agent_id, ts, Some(&partition), &values).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn insert_raw<'e, E>(
    exec: E,
    spec: &KindSpec,
    agent_id: &str,
    ts: i64,
    partition: Option<&str>,
    values: &[Option<f64>],
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = spec.raw_insert_sql();
    let mut query = sqlx::query(&sql).bind(agent_id).bind(ts);
    if let Some(partition) = partition {
        query = query.bind(partition.to_string());
    }
    for value in values {
        query = query.bind(*value);
    }
    query.execute(exec).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_decode_rejects_malformed_payload() {
        let err = decode::<CpuMetrics>(json!({"usage": "high"}));
        assert!(matches!(err, Err(FleetError::BadInput(_))));
    }

    #[test]
    fn bad_array_element_is_skipped_not_fatal() {
        let spec = spec_for(MetricKind::Disk);
        let rows: Vec<DiskMetrics> = decode_elements(
            json!([
                { "mount": "/", "totalBytes": 100.0, "usedBytes": 40.0, "usedPct": 40.0 },
                { "mount": 17 },
                { "mount": "/var", "totalBytes": 50.0, "usedBytes": 10.0, "usedPct": 20.0 }
            ]),
            spec,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mount, "/");
        assert_eq!(rows[1].mount, "/var");
    }

    #[test]
    fn non_array_payload_for_array_kind_yields_nothing() {
        let spec = spec_for(MetricKind::Network);
        let rows: Vec<NetworkMetrics> = decode_elements(json!({"interface": "eth0"}), spec);
        assert!(rows.is_empty());
    }
}

//! Per-kind table metadata. Every metric kind maps to a raw table and
//! an aggregate table; the three pipelines (ingest, rollup, query)
//! derive their SQL from the same column lists so the schemas cannot
//! drift apart.
//!
//! All value columns are double precision. Multi-partition kinds carry
//! one extra text column (mount / interface / device / sensor /
//! monitor id) that is preserved through aggregation and is part of
//! the aggregate idempotence key.

use fleet_core::MetricKind;

pub const BUCKET_SECONDS: [i64; 3] = [60, 300, 3600];

pub struct KindSpec {
    pub kind: MetricKind,
    pub raw_table: &'static str,
    pub agg_table: &'static str,
    /// Column name of the partition key, when the kind has one.
    pub partition_column: Option<&'static str>,
    pub value_columns: &'static [&'static str],
}

pub const KIND_SPECS: [KindSpec; 10] = [
    KindSpec {
        kind: MetricKind::Cpu,
        raw_table: "cpu",
        agg_table: "cpu_agg",
        partition_column: None,
        value_columns: &["usage_pct"],
    },
    KindSpec {
        kind: MetricKind::Memory,
        raw_table: "memory",
        agg_table: "memory_agg",
        partition_column: None,
        value_columns: &[
            "total_bytes",
            "used_bytes",
            "used_pct",
            "swap_total_bytes",
            "swap_used_bytes",
        ],
    },
    KindSpec {
        kind: MetricKind::Disk,
        raw_table: "disk",
        agg_table: "disk_agg",
        partition_column: Some("mount"),
        value_columns: &["total_bytes", "used_bytes", "used_pct"],
    },
    KindSpec {
        kind: MetricKind::Network,
        raw_table: "network",
        agg_table: "network_agg",
        partition_column: Some("interface"),
        value_columns: &["rx_bytes_per_sec", "tx_bytes_per_sec"],
    },
    KindSpec {
        kind: MetricKind::Connections,
        raw_table: "connections",
        agg_table: "connections_agg",
        partition_column: None,
        value_columns: &["tcp_count", "udp_count"],
    },
    KindSpec {
        kind: MetricKind::DiskIo,
        raw_table: "disk_io",
        agg_table: "disk_io_agg",
        partition_column: Some("device"),
        value_columns: &["read_bytes_per_sec", "write_bytes_per_sec"],
    },
    KindSpec {
        kind: MetricKind::Host,
        raw_table: "host_info",
        agg_table: "host_info_agg",
        partition_column: None,
        value_columns: &["uptime_secs", "process_count"],
    },
    KindSpec {
        kind: MetricKind::Gpu,
        raw_table: "gpu",
        agg_table: "gpu_agg",
        partition_column: Some("device"),
        value_columns: &[
            "usage_pct",
            "memory_total_bytes",
            "memory_used_bytes",
            "temperature_c",
        ],
    },
    KindSpec {
        kind: MetricKind::Temperature,
        raw_table: "temperature",
        agg_table: "temperature_agg",
        partition_column: Some("sensor"),
        value_columns: &["celsius"],
    },
    KindSpec {
        kind: MetricKind::Monitor,
        raw_table: "monitor_results",
        agg_table: "monitor_results_agg",
        partition_column: Some("monitor_id"),
        value_columns: &["up", "latency_ms", "cert_days_left"],
    },
];

pub fn spec_for(kind: MetricKind) -> &'static KindSpec {
    KIND_SPECS
        .iter()
        .find(|s| s.kind == kind)
        .unwrap_or(&KIND_SPECS[0])
}

impl KindSpec {
    /// `INSERT INTO raw (agent_id, ts, [part,] c1, c2, …) VALUES ($1, …)`
    pub fn raw_insert_sql(&self) -> String {
        let mut cols = vec!["agent_id", "ts"];
        if let Some(part) = self.partition_column {
            cols.push(part);
        }
        cols.extend_from_slice(self.value_columns);
        let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("${i}")).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.raw_table,
            cols.join(", "),
            placeholders.join(", ")
        )
    }

    /// DDL for the raw table. `ts` is bigint milliseconds; the value
    /// columns allow NULL so optional readings (e.g. cert days for a
    /// plain-HTTP monitor) do not block the row.
    pub fn raw_create_sql(&self) -> String {
        let mut ddl = String::from("CREATE TABLE IF NOT EXISTS ");
        ddl.push_str(self.raw_table);
        ddl.push_str(" (\n    agent_id text NOT NULL,\n    ts bigint NOT NULL");
        if let Some(part) = self.partition_column {
            ddl.push_str(&format!(",\n    {part} text NOT NULL"));
        }
        for col in self.value_columns {
            ddl.push_str(&format!(",\n    {col} double precision"));
        }
        ddl.push_str("\n)");
        ddl
    }

    pub fn raw_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {t}_agent_ts_idx ON {t} (agent_id, ts)",
            t = self.raw_table
        )
    }

    /// DDL for the aggregate table. Each value column becomes
    /// `{col}_avg/_min/_max`; the UNIQUE constraint is the idempotence
    /// key the rollup upserts against.
    pub fn agg_create_sql(&self) -> String {
        let mut ddl = String::from("CREATE TABLE IF NOT EXISTS ");
        ddl.push_str(self.agg_table);
        ddl.push_str(" (\n    agent_id text NOT NULL");
        if let Some(part) = self.partition_column {
            ddl.push_str(&format!(",\n    {part} text NOT NULL"));
        }
        ddl.push_str(",\n    bucket_start bigint NOT NULL");
        ddl.push_str(",\n    bucket_seconds bigint NOT NULL");
        for col in self.value_columns {
            ddl.push_str(&format!(",\n    {col}_avg double precision"));
            ddl.push_str(&format!(",\n    {col}_min double precision"));
            ddl.push_str(&format!(",\n    {col}_max double precision"));
        }
        ddl.push_str(",\n    sample_count bigint NOT NULL");
        ddl.push_str(&format!(",\n    UNIQUE ({})", self.agg_key_columns().join(", ")));
        ddl.push_str("\n)");
        ddl
    }

    pub fn agg_key_columns(&self) -> Vec<&'static str> {
        let mut key = vec!["agent_id"];
        if let Some(part) = self.partition_column {
            key.push(part);
        }
        key.push("bucket_seconds");
        key.push("bucket_start");
        key
    }

    /// One-statement rollup for a closed range: group raw rows into
    /// buckets and upsert avg/min/max per column. `$1` = bucket ms,
    /// `$2` = bucket seconds, `$3`/`$4` = inclusive ts range.
    pub fn rollup_sql(&self) -> String {
        let part_select = self
            .partition_column
            .map(|p| format!("{p}, "))
            .unwrap_or_default();

        let mut insert_cols = vec!["agent_id".to_string()];
        if let Some(part) = self.partition_column {
            insert_cols.push(part.to_string());
        }
        insert_cols.push("bucket_start".to_string());
        insert_cols.push("bucket_seconds".to_string());

        let mut select_aggs = Vec::new();
        let mut updates = Vec::new();
        for col in self.value_columns {
            insert_cols.push(format!("{col}_avg"));
            insert_cols.push(format!("{col}_min"));
            insert_cols.push(format!("{col}_max"));
            select_aggs.push(format!("avg({col}), min({col}), max({col})"));
            updates.push(format!("{col}_avg = EXCLUDED.{col}_avg"));
            updates.push(format!("{col}_min = EXCLUDED.{col}_min"));
            updates.push(format!("{col}_max = EXCLUDED.{col}_max"));
        }
        insert_cols.push("sample_count".to_string());
        updates.push("sample_count = EXCLUDED.sample_count".to_string());

        format!(
            "INSERT INTO {agg} ({cols})\n\
             SELECT agent_id, {part}(ts / $1) * $1, $2::bigint, {aggs}, count(*)\n\
             FROM {raw}\n\
             WHERE ts >= $3 AND ts <= $4\n\
             GROUP BY agent_id, {part}(ts / $1)\n\
             ON CONFLICT ({key}) DO UPDATE SET {updates}",
            agg = self.agg_table,
            cols = insert_cols.join(", "),
            part = part_select,
            aggs = select_aggs.join(", "),
            raw = self.raw_table,
            key = self.agg_key_columns().join(", "),
            updates = updates.join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_spec() {
        for kind in MetricKind::ALL {
            assert_eq!(spec_for(kind).kind, kind);
        }
    }

    #[test]
    fn raw_insert_binds_every_column() {
        let spec = spec_for(MetricKind::Disk);
        let sql = spec.raw_insert_sql();
        // agent_id, ts, mount, 3 value columns
        assert!(sql.contains("$6"));
        assert!(!sql.contains("$7"));
        assert!(sql.starts_with("INSERT INTO disk "));
        assert!(sql.contains("mount"));
    }

    #[test]
    fn scalar_kind_has_no_partition() {
        let spec = spec_for(MetricKind::Cpu);
        assert!(spec.partition_column.is_none());
        assert_eq!(
            spec.agg_key_columns(),
            vec!["agent_id", "bucket_seconds", "bucket_start"]
        );
    }

    #[test]
    fn agg_ddl_carries_idempotence_key() {
        let ddl = spec_for(MetricKind::Network).agg_create_sql();
        assert!(ddl.contains("UNIQUE (agent_id, interface, bucket_seconds, bucket_start)"));
        assert!(ddl.contains("rx_bytes_per_sec_avg"));
        assert!(ddl.contains("tx_bytes_per_sec_max"));
    }

    #[test]
    fn rollup_sql_upserts_on_the_key() {
        let sql = spec_for(MetricKind::Gpu).rollup_sql();
        assert!(sql.contains("ON CONFLICT (agent_id, device, bucket_seconds, bucket_start)"));
        assert!(sql.contains("avg(usage_pct), min(usage_pct), max(usage_pct)"));
        assert!(sql.contains("GROUP BY agent_id, device, (ts / $1)"));
        assert!(sql.contains("count(*)"));
    }
}

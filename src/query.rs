//! Adaptive read path. The planner is pure: for a fixed (now, start,
//! end, requested) it always produces the same plan. It normalizes the
//! range, picks an interval from the duration table, widens it to stay
//! inside the max-points budget, aligns it to the allowed set, and
//! routes to raw rows or an aggregate bucket width.
//!
//! Raw rows are projected into the same `{timestamp, value}` shape as
//! aggregate rows (grouped into interval buckets, averaged), so the
//! response envelope is uniform no matter which table served it.

use std::collections::BTreeMap;

use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::Result;
use crate::metrics::spec_for;
use crate::models::{MetricsResponse, QueryRange, Series, SeriesPoint};
use crate::rollup::align_down;
use fleet_core::MetricKind;

/// Intervals (seconds) a plan may use, in ascending order.
pub const ALIGN_SET: [i64; 15] =
    [1, 2, 5, 10, 15, 30, 60, 120, 300, 600, 900, 1800, 3600, 7200, 14400];

/// `(max duration seconds, base interval seconds)`; the last row is
/// the catch-all.
const DURATION_TABLE: [(i64, i64); 12] = [
    (60, 2),
    (300, 5),
    (900, 15),
    (1800, 30),
    (3600, 60),
    (10_800, 180),
    (21_600, 300),
    (43_200, 600),
    (86_400, 900),
    (259_200, 1800),
    (604_800, 3600),
    (1_209_600, 7200),
];
const MAX_INTERVAL: i64 = 14_400;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Source {
    Raw,
    Aggregate { bucket_seconds: i64 },
}

#[derive(Clone, Copy, Debug)]
pub struct QueryPlan {
    pub start_ms: i64,
    pub end_ms: i64,
    pub interval_secs: i64,
    pub source: Source,
}

pub fn plan(
    now_ms: i64,
    start_ms: i64,
    end_ms: i64,
    requested_secs: i64,
    retention_ms: i64,
    max_points: usize,
) -> QueryPlan {
    // Normalize: nothing older than retention, and a non-empty range.
    let start_ms = start_ms.max(now_ms - retention_ms);
    let end_ms = if end_ms <= start_ms { start_ms + 1000 } else { end_ms };
    let range_ms = end_ms - start_ms;

    let base_secs = if requested_secs > 0 {
        requested_secs
    } else {
        base_interval(range_ms / 1000)
    };

    // Widen so the response stays within the point budget.
    let max_points_i64 = max_points.max(1) as i64;
    let required_ms = (range_ms + max_points_i64 - 1) / max_points_i64;
    let interval_ms = (base_secs * 1000).max(required_ms);
    let interval_secs = align_interval((interval_ms + 999) / 1000);

    let source = if interval_secs >= 3600 {
        Source::Aggregate { bucket_seconds: 3600 }
    } else if interval_secs >= 300 {
        Source::Aggregate { bucket_seconds: 300 }
    } else if interval_secs >= 60 {
        Source::Aggregate { bucket_seconds: 60 }
    } else {
        Source::Raw
    };

    QueryPlan { start_ms, end_ms, interval_secs, source }
}

fn base_interval(duration_secs: i64) -> i64 {
    for (max_duration, interval) in DURATION_TABLE {
        if duration_secs <= max_duration {
            return interval;
        }
    }
    MAX_INTERVAL
}

/// Round up to the nearest allowed interval; past the top of the set,
/// the largest applies.
fn align_interval(interval_secs: i64) -> i64 {
    for allowed in ALIGN_SET {
        if interval_secs <= allowed {
            return allowed;
        }
    }
    MAX_INTERVAL
}

/// One fetched row before series assembly: optional partition key,
/// timestamp, one optional value per value column.
pub struct RowPoint {
    pub partition: Option<String>,
    pub ts: i64,
    pub values: Vec<Option<f64>>,
}

/// Group points into interval buckets per (partition, column) and
/// average duplicates — the read path tolerates duplicate raw rows by
/// grouping. Output series are ordered by partition then column.
pub fn assemble_series(
    points: Vec<RowPoint>,
    columns: &[&str],
    partition_label: Option<&str>,
    interval_ms: i64,
) -> Vec<Series> {
    // (partition, column index) -> bucket -> (sum, count)
    let mut grouped: BTreeMap<(Option<String>, usize), BTreeMap<i64, (f64, u32)>> = BTreeMap::new();
    for point in points {
        let bucket = align_down(point.ts, interval_ms);
        for (idx, value) in point.values.iter().enumerate() {
            let Some(value) = value else { continue };
            let cell = grouped
                .entry((point.partition.clone(), idx))
                .or_default()
                .entry(bucket)
                .or_insert((0.0, 0));
            cell.0 += value;
            cell.1 += 1;
        }
    }

    grouped
        .into_iter()
        .map(|((partition, idx), buckets)| {
            let labels = match (partition_label, partition) {
                (Some(label), Some(value)) => {
                    let mut map = BTreeMap::new();
                    map.insert(label.to_string(), value);
                    Some(map)
                }
                _ => None,
            };
            Series {
                name: columns.get(idx).copied().unwrap_or("value").to_string(),
                labels,
                data: buckets
                    .into_iter()
                    .map(|(timestamp, (sum, n))| SeriesPoint {
                        timestamp,
                        value: sum / n as f64,
                    })
                    .collect(),
            }
        })
        .collect()
}

pub async fn get_metrics(
    pool: &PgPool,
    agent_id: &str,
    kind: MetricKind,
    start_ms: i64,
    end_ms: i64,
    requested_secs: i64,
    retention_ms: i64,
    max_points: usize,
    now_ms: i64,
) -> Result<MetricsResponse> {
    let plan = plan(now_ms, start_ms, end_ms, requested_secs, retention_ms, max_points);
    let spec = spec_for(kind);
    let interval_ms = plan.interval_secs * 1000;

    let points = match plan.source {
        Source::Aggregate { bucket_seconds } => {
            let points = fetch_aggregate(pool, spec, agent_id, &plan, bucket_seconds).await?;
            if points.is_empty() {
                // Gap in the aggregates (e.g. rollup not caught up):
                // serve the same range from raw.
                debug!(kind = spec.raw_table, "aggregate range empty, falling back to raw");
                fetch_raw(pool, spec, agent_id, &plan).await?
            } else {
                points
            }
        }
        Source::Raw => fetch_raw(pool, spec, agent_id, &plan).await?,
    };

    let series = assemble_series(points, spec.value_columns, spec.partition_column, interval_ms);
    Ok(MetricsResponse {
        agent_id: agent_id.to_string(),
        kind: kind.as_str().to_string(),
        range: QueryRange {
            start: plan.start_ms,
            end: plan.end_ms,
            interval_seconds: plan.interval_secs,
        },
        series,
    })
}

async fn fetch_raw(
    pool: &PgPool,
    spec: &crate::metrics::KindSpec,
    agent_id: &str,
    plan: &QueryPlan,
) -> Result<Vec<RowPoint>> {
    let part = spec.partition_column.map(|p| format!(", {p}")).unwrap_or_default();
    let cols = spec.value_columns.join(", ");
    let sql = format!(
        "SELECT ts{part}, {cols} FROM {raw} \
         WHERE agent_id = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts",
        raw = spec.raw_table,
    );
    let rows = sqlx::query(&sql)
        .bind(agent_id)
        .bind(plan.start_ms)
        .bind(plan.end_ms)
        .fetch_all(pool)
        .await?;
    rows_to_points(rows, spec)
}

async fn fetch_aggregate(
    pool: &PgPool,
    spec: &crate::metrics::KindSpec,
    agent_id: &str,
    plan: &QueryPlan,
    bucket_seconds: i64,
) -> Result<Vec<RowPoint>> {
    let part = spec.partition_column.map(|p| format!(", {p}")).unwrap_or_default();
    let cols: Vec<String> = spec
        .value_columns
        .iter()
        .map(|c| format!("{c}_avg AS {c}"))
        .collect();
    // When the plan interval is wider than the bucket, thin to the
    // interval grid so the point budget still holds.
    let grid = if plan.interval_secs > bucket_seconds {
        " AND bucket_start % $5 = 0"
    } else {
        ""
    };
    let sql = format!(
        "SELECT bucket_start AS ts{part}, {cols} FROM {agg} \
         WHERE agent_id = $1 AND bucket_seconds = $2 \
           AND bucket_start >= $3 AND bucket_start <= $4{grid} ORDER BY bucket_start",
        agg = spec.agg_table,
        cols = cols.join(", "),
    );
    let mut query = sqlx::query(&sql)
        .bind(agent_id)
        .bind(bucket_seconds)
        .bind(plan.start_ms)
        .bind(plan.end_ms);
    if !grid.is_empty() {
        query = query.bind(plan.interval_secs * 1000);
    }
    let rows = query.fetch_all(pool).await?;
    rows_to_points(rows, spec)
}

fn rows_to_points(
    rows: Vec<sqlx::postgres::PgRow>,
    spec: &crate::metrics::KindSpec,
) -> Result<Vec<RowPoint>> {
    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        let ts: i64 = row.try_get("ts")?;
        let partition = match spec.partition_column {
            Some(col) => Some(row.try_get::<String, _>(col)?),
            None => None,
        };
        let mut values = Vec::with_capacity(spec.value_columns.len());
        for col in spec.value_columns {
            values.push(row.try_get::<Option<f64>, _>(*col)?);
        }
        points.push(RowPoint { partition, ts, values });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;
    const DAY_MS: i64 = 24 * HOUR_MS;
    const RETENTION_MS: i64 = 7 * DAY_MS;
    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn base_interval_follows_duration_table() {
        assert_eq!(base_interval(45), 2);
        assert_eq!(base_interval(60), 2);
        assert_eq!(base_interval(90), 5);
        assert_eq!(base_interval(3600), 60);
        assert_eq!(base_interval(86_400), 900);
        assert_eq!(base_interval(604_800), 3600);
        assert_eq!(base_interval(10_000_000), MAX_INTERVAL);
    }

    #[test]
    fn align_rounds_up_to_allowed() {
        assert_eq!(align_interval(1), 1);
        assert_eq!(align_interval(3), 5);
        assert_eq!(align_interval(61), 120);
        assert_eq!(align_interval(840), 900);
        assert_eq!(align_interval(20_000), MAX_INTERVAL);
    }

    #[test]
    fn empty_range_is_widened() {
        let p = plan(NOW, NOW, NOW - 5000, 0, RETENTION_MS, 720);
        assert_eq!(p.end_ms, p.start_ms + 1000);
    }

    #[test]
    fn start_clamps_to_retention() {
        let p = plan(NOW, 0, NOW, 0, RETENTION_MS, 720);
        assert_eq!(p.start_ms, NOW - RETENTION_MS);
    }

    #[test]
    fn seven_days_routes_to_hour_buckets_within_budget() {
        let p = plan(NOW, NOW - 7 * DAY_MS, NOW, 0, RETENTION_MS, 720);
        assert_eq!(p.interval_secs, 3600);
        assert_eq!(p.source, Source::Aggregate { bucket_seconds: 3600 });
        // 7 days at 3600 s is 168 points, within the 720 budget.
        assert!((p.end_ms - p.start_ms) / (p.interval_secs * 1000) <= 720);
    }

    #[test]
    fn short_range_stays_on_raw() {
        let p = plan(NOW, NOW - 90_000, NOW, 0, RETENTION_MS, 720);
        assert!(p.interval_secs < 60);
        assert_eq!(p.source, Source::Raw);
    }

    #[test]
    fn requested_interval_is_honored_and_routed() {
        let p = plan(NOW, NOW - HOUR_MS, NOW, 300, RETENTION_MS, 720);
        assert_eq!(p.interval_secs, 300);
        assert_eq!(p.source, Source::Aggregate { bucket_seconds: 300 });

        let p = plan(NOW, NOW - HOUR_MS, NOW, 60, RETENTION_MS, 720);
        assert_eq!(p.source, Source::Aggregate { bucket_seconds: 60 });
    }

    #[test]
    fn tiny_point_budget_forces_wide_interval() {
        let p = plan(NOW, NOW - HOUR_MS, NOW, 0, RETENTION_MS, 10);
        // 3600 s over 10 points needs 360 s; aligned up to 600.
        assert_eq!(p.interval_secs, 600);
        assert_eq!(p.source, Source::Aggregate { bucket_seconds: 300 });
    }

    #[test]
    fn plan_is_deterministic() {
        let a = plan(NOW, NOW - DAY_MS, NOW, 0, RETENTION_MS, 720);
        let b = plan(NOW, NOW - DAY_MS, NOW, 0, RETENTION_MS, 720);
        assert_eq!(a.interval_secs, b.interval_secs);
        assert_eq!(a.source, b.source);
        assert_eq!((a.start_ms, a.end_ms), (b.start_ms, b.end_ms));
    }

    #[test]
    fn assemble_groups_duplicates_into_buckets() {
        let points = vec![
            RowPoint { partition: None, ts: 1_000, values: vec![Some(10.0)] },
            RowPoint { partition: None, ts: 1_500, values: vec![Some(20.0)] },
            RowPoint { partition: None, ts: 61_000, values: vec![Some(40.0)] },
        ];
        let series = assemble_series(points, &["usage_pct"], None, 60_000);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "usage_pct");
        assert_eq!(series[0].data.len(), 2);
        assert_eq!(series[0].data[0], SeriesPoint { timestamp: 0, value: 15.0 });
        assert_eq!(series[0].data[1], SeriesPoint { timestamp: 60_000, value: 40.0 });
    }

    #[test]
    fn assemble_splits_partitions_into_labeled_series() {
        let points = vec![
            RowPoint { partition: Some("/".into()), ts: 0, values: vec![Some(1.0), Some(2.0)] },
            RowPoint { partition: Some("/var".into()), ts: 0, values: vec![Some(3.0), Some(4.0)] },
        ];
        let series = assemble_series(points, &["total_bytes", "used_bytes"], Some("mount"), 60_000);
        assert_eq!(series.len(), 4);
        let root_total = series
            .iter()
            .find(|s| {
                s.name == "total_bytes"
                    && s.labels.as_ref().is_some_and(|l| l.get("mount") == Some(&"/".to_string()))
            })
            .unwrap();
        assert_eq!(root_total.data[0].value, 1.0);
    }

    #[test]
    fn assemble_skips_null_values() {
        let points = vec![
            RowPoint { partition: Some("m1".into()), ts: 0, values: vec![Some(1.0), None] },
        ];
        let series = assemble_series(points, &["up", "cert_days_left"], Some("monitor_id"), 60_000);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "up");
    }
}

//! Downsampling and retention. Every minute each (kind, bucket width)
//! pair rolls raw rows forward from its recorded progress into
//! fixed-width aggregate buckets, then old rows are deleted.
//!
//! Progress advances only after the aggregate upsert commits, so a
//! crash between the two re-aggregates the same range on the next
//! tick; the composite upsert key makes that idempotent.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::metrics::{BUCKET_SECONDS, KIND_SPECS, KindSpec};

pub fn align_down(ts_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return ts_ms;
    }
    (ts_ms.div_euclid(bucket_ms)) * bucket_ms
}

/// Pick the range for one rollup pass: `start` is the bucket after the
/// recorded progress (or the retention boundary on first run), and
/// `end_bucket` is the newest bucket old enough that no samples for it
/// are still in flight — the `now − bucket` grace period. Returns None
/// when there is nothing new to close.
pub fn plan_range(
    last_bucket: Option<i64>,
    now_ms: i64,
    retention_ms: i64,
    bucket_secs: i64,
) -> Option<(i64, i64)> {
    let bucket_ms = bucket_secs * 1000;
    let start = match last_bucket {
        Some(last) => last + bucket_ms,
        None => align_down(now_ms - retention_ms, bucket_ms),
    };
    let end_bucket = align_down(now_ms - bucket_ms, bucket_ms);
    if end_bucket <= start {
        return None;
    }
    Some((start, end_bucket))
}

pub async fn rollup_tick(pool: &PgPool, retention_ms: i64, now_ms: i64) -> Result<()> {
    for spec in &KIND_SPECS {
        for bucket_secs in BUCKET_SECONDS {
            rollup_one(pool, spec, bucket_secs, retention_ms, now_ms).await?;
        }
    }
    Ok(())
}

async fn rollup_one(
    pool: &PgPool,
    spec: &KindSpec,
    bucket_secs: i64,
    retention_ms: i64,
    now_ms: i64,
) -> Result<()> {
    let kind = spec.kind.as_str();
    let last_bucket: Option<(i64,)> = sqlx::query_as(
        r#"SELECT last_bucket FROM aggregation_progress WHERE metric_kind = $1 AND bucket_seconds = $2"#,
    )
    .bind(kind)
    .bind(bucket_secs)
    .fetch_optional(pool)
    .await?;

    let Some((start, end_bucket)) =
        plan_range(last_bucket.map(|r| r.0), now_ms, retention_ms, bucket_secs)
    else {
        return Ok(());
    };

    let bucket_ms = bucket_secs * 1000;
    let sql = spec.rollup_sql();
    let res = sqlx::query(&sql)
        .bind(bucket_ms)
        .bind(bucket_secs)
        .bind(start)
        .bind(end_bucket + bucket_ms - 1)
        .execute(pool)
        .await?;

    // Monotonic advance: GREATEST guards against a concurrent writer
    // having moved progress further already.
    sqlx::query(
        r#"
        INSERT INTO aggregation_progress (metric_kind, bucket_seconds, last_bucket)
        VALUES ($1, $2, $3)
        ON CONFLICT (metric_kind, bucket_seconds) DO UPDATE SET
            last_bucket = GREATEST(aggregation_progress.last_bucket, EXCLUDED.last_bucket),
            updated_at = now()
    "#,
    )
    .bind(kind)
    .bind(bucket_secs)
    .bind(end_bucket)
    .execute(pool)
    .await?;

    debug!(
        kind,
        bucket_secs,
        start,
        end_bucket,
        rows = res.rows_affected(),
        "rollup pass complete"
    );
    Ok(())
}

/// Delete raw rows past the raw retention and aggregate rows past the
/// (longer) aggregate retention.
pub async fn retention_tick(
    pool: &PgPool,
    retention_ms: i64,
    agg_retention_ms: i64,
    now_ms: i64,
) -> Result<()> {
    let raw_cutoff = now_ms - retention_ms;
    let agg_cutoff = now_ms - agg_retention_ms;
    for spec in &KIND_SPECS {
        let res = sqlx::query(&format!("DELETE FROM {} WHERE ts < $1", spec.raw_table))
            .bind(raw_cutoff)
            .execute(pool)
            .await?;
        if res.rows_affected() > 0 {
            debug!(table = spec.raw_table, deleted = res.rows_affected(), "raw retention");
        }
        sqlx::query(&format!("DELETE FROM {} WHERE bucket_start < $1", spec.agg_table))
            .bind(agg_cutoff)
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_MS: i64 = 60_000;

    #[test]
    fn align_down_is_stable_on_boundaries() {
        assert_eq!(align_down(120_000, MIN_MS), 120_000);
        assert_eq!(align_down(120_001, MIN_MS), 120_000);
        assert_eq!(align_down(179_999, MIN_MS), 120_000);
        assert_eq!(align_down(180_000, MIN_MS), 180_000);
    }

    #[test]
    fn sample_at_last_millisecond_belongs_to_its_bucket() {
        // [bucket_start, bucket_start + width) — the last millisecond
        // stays in, the next one starts a new bucket.
        let bucket_start = 600_000;
        assert_eq!(align_down(bucket_start + MIN_MS - 1, MIN_MS), bucket_start);
        assert_eq!(align_down(bucket_start + MIN_MS, MIN_MS), bucket_start + MIN_MS);
    }

    #[test]
    fn first_run_starts_at_retention_boundary() {
        let retention = 7 * 24 * 3600 * 1000i64;
        let now = 1_700_000_000_000;
        let (start, end) = plan_range(None, now, retention, 60).unwrap();
        assert_eq!(start % MIN_MS, 0);
        assert_eq!(start, align_down(now - retention, MIN_MS));
        assert_eq!(end, align_down(now - MIN_MS, MIN_MS));
        assert!(end > start);
    }

    #[test]
    fn progress_resumes_after_last_bucket() {
        let now = 1_700_000_600_000;
        let last = align_down(now, MIN_MS) - 5 * MIN_MS;
        let (start, end) = plan_range(Some(last), now, i64::MAX / 2, 60).unwrap();
        assert_eq!(start, last + MIN_MS);
        assert_eq!(end, align_down(now - MIN_MS, MIN_MS));
    }

    #[test]
    fn open_bucket_is_left_alone() {
        // Progress is caught up: the only candidate bucket is still
        // within its grace period, so the pass skips.
        let now = 1_700_000_000_000;
        let end = align_down(now - MIN_MS, MIN_MS);
        assert!(plan_range(Some(end), now, i64::MAX / 2, 60).is_none());
        assert!(plan_range(Some(end - 2 * MIN_MS), now, i64::MAX / 2, 60).is_some());
    }

    #[test]
    fn hour_buckets_align_to_hours() {
        let hour_ms = 3_600_000;
        let now = 1_699_999_999_999;
        let (start, end) = plan_range(None, now, 7 * 24 * 3_600_000, 3600).unwrap();
        assert_eq!(start % hour_ms, 0);
        assert_eq!(end % hour_ms, 0);
    }

    #[test]
    fn every_kind_rolls_up_three_widths() {
        assert_eq!(BUCKET_SECONDS, [60, 300, 3600]);
        assert_eq!(KIND_SPECS.len(), 10);
    }
}

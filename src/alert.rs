//! Alert engine. Each scan tick walks every (agent, enabled rule)
//! pair, reads the latest sample for the rule's metric (freshness over
//! precision: raw rows, newest first), and advances the per-key state
//! machine. Firing inserts an append-only record and remembers its id
//! on the state row; resolution mutates that record in place and
//! clears the state. The record status is the source of truth — a
//! failed notification is only a log line.
//!
//! A sample-read failure leaves the state row untouched so a flaky
//! read cannot produce a spurious resolve.

use sqlx::{PgPool, Row};
use tracing::{error, warn};

use crate::db::{list_agents, set_agent_status};
use crate::error::Result;
use crate::models::{
    ALERT_FIRING, ALERT_RESOLVED, AgentRow, AlertStateRow, STATUS_OFFLINE, STATUS_ONLINE,
};
use crate::notify::{AlertEvent, EventKind, NotifyHandle};
use crate::property::{AlertConfig, PropertyStore, ThresholdRule};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    /// Not breached, no state: nothing to do.
    Ignore,
    /// Streak bookkeeping only (start or continue, or refresh a
    /// firing row's value).
    Track,
    Fire,
    Resolve,
    /// Streak ended before it fired: drop the state row.
    Clear,
}

/// Pure transition function. `breached` is computed by the caller so
/// inverted comparisons (certificate days left) go through the same
/// machine.
pub fn next_action(
    existing: Option<&AlertStateRow>,
    breached: bool,
    now_ms: i64,
    duration_secs: i64,
) -> Action {
    if breached {
        if existing.is_some_and(|s| s.is_firing) {
            return Action::Track;
        }
        let start = existing
            .map(|s| s.start_time)
            .filter(|t| *t > 0)
            .unwrap_or(now_ms);
        if now_ms - start >= duration_secs * 1000 {
            Action::Fire
        } else {
            Action::Track
        }
    } else {
        match existing {
            None => Action::Ignore,
            Some(state) if state.is_firing => Action::Resolve,
            Some(_) => Action::Clear,
        }
    }
}

/// One rule evaluation, ready to be applied to the state machine.
struct RuleEval {
    rule_key: String,
    alert_type: &'static str,
    value: f64,
    threshold: f64,
    duration_secs: i64,
    breached: bool,
    message: String,
    level: &'static str,
}

pub async fn scan_tick(
    pool: &PgPool,
    props: &PropertyStore,
    notify: &NotifyHandle,
    now_ms: i64,
) -> Result<()> {
    let cfg = props.alert_config().await;
    let agents = list_agents(pool).await?;
    for agent in &agents {
        if let Err(err) = scan_agent(pool, notify, &cfg, agent, now_ms).await {
            if err.is_irrecoverable_db() {
                return Err(err);
            }
            warn!(agent_id = %agent.id, "alert scan failed for agent: {err}");
        }
    }
    gc_stale_states(pool).await?;
    Ok(())
}

async fn scan_agent(
    pool: &PgPool,
    notify: &NotifyHandle,
    cfg: &AlertConfig,
    agent: &AgentRow,
    now_ms: i64,
) -> Result<()> {
    if cfg.cpu.enabled {
        if let Some(value) = latest_scalar(pool, "cpu", "usage_pct", &agent.id).await? {
            let eval = threshold_eval("cpu", "cpu", value, &cfg.cpu, "warning", format!(
                "CPU usage on {} is {value:.1}% (threshold {:.0}%)",
                agent.name, cfg.cpu.threshold
            ));
            apply_rule(pool, notify, agent, eval, now_ms).await?;
        }
    }

    if cfg.memory.enabled {
        if let Some(value) = latest_scalar(pool, "memory", "used_pct", &agent.id).await? {
            let eval = threshold_eval("memory", "memory", value, &cfg.memory, "warning", format!(
                "Memory usage on {} is {value:.1}% (threshold {:.0}%)",
                agent.name, cfg.memory.threshold
            ));
            apply_rule(pool, notify, agent, eval, now_ms).await?;
        }
    }

    if cfg.disk.enabled {
        for (mount, values) in
            latest_partitions(pool, "disk", "mount", &["used_pct"], &agent.id).await?
        {
            let Some(value) = values.first().copied().flatten() else { continue };
            let eval = threshold_eval(
                &format!("disk:{mount}"),
                "disk",
                value,
                &cfg.disk,
                "warning",
                format!(
                    "Disk usage of {mount} on {} is {value:.1}% (threshold {:.0}%)",
                    agent.name, cfg.disk.threshold
                ),
            );
            apply_rule(pool, notify, agent, eval, now_ms).await?;
        }
    }

    if cfg.network.enabled {
        for (interface, values) in latest_partitions(
            pool,
            "network",
            "interface",
            &["rx_bytes_per_sec", "tx_bytes_per_sec"],
            &agent.id,
        )
        .await?
        {
            let rx = values.first().copied().flatten().unwrap_or(0.0);
            let tx = values.get(1).copied().flatten().unwrap_or(0.0);
            let value = network_mbps(rx, tx);
            let eval = threshold_eval(
                &format!("network:{interface}"),
                "network",
                value,
                &cfg.network,
                "warning",
                format!(
                    "Network throughput on {} ({interface}) is {value:.1} MB/s (threshold {:.0} MB/s)",
                    agent.name, cfg.network.threshold
                ),
            );
            apply_rule(pool, notify, agent, eval, now_ms).await?;
        }
    }

    if cfg.offline.enabled && agent.last_seen_at > 0 {
        let elapsed_secs = ((now_ms - agent.last_seen_at).max(0) / 1000) as f64;
        let eval = RuleEval {
            rule_key: "offline".to_string(),
            alert_type: "offline",
            value: elapsed_secs,
            threshold: cfg.offline.threshold,
            duration_secs: cfg.offline.duration,
            breached: elapsed_secs > cfg.offline.threshold,
            message: format!(
                "Agent {} has been offline for {elapsed_secs:.0}s (threshold {:.0}s)",
                agent.name, cfg.offline.threshold
            ),
            level: "critical",
        };
        // This rule owns the agent's online/offline status flip.
        match apply_rule(pool, notify, agent, eval, now_ms).await? {
            Action::Fire => set_agent_status(pool, &agent.id, STATUS_OFFLINE).await?,
            Action::Resolve => set_agent_status(pool, &agent.id, STATUS_ONLINE).await?,
            _ => {}
        }
    }

    if cfg.cert.enabled || cfg.service.enabled {
        for monitor in latest_monitors(pool, &agent.id).await? {
            if cfg.cert.enabled {
                // Only HTTPS checks report days left; comparison is
                // inverted — fewer days than the threshold breaches.
                if let Some(days) = monitor.cert_days_left {
                    let eval = RuleEval {
                        rule_key: format!("cert:{}", monitor.monitor_id),
                        alert_type: "cert",
                        value: days,
                        threshold: cfg.cert.threshold,
                        duration_secs: cfg.cert.duration,
                        breached: days < cfg.cert.threshold,
                        message: format!(
                            "Certificate for monitor {} on {} expires in {days:.0} days (threshold {:.0})",
                            monitor.monitor_id, agent.name, cfg.cert.threshold
                        ),
                        level: "warning",
                    };
                    apply_rule(pool, notify, agent, eval, now_ms).await?;
                }
            }
            if cfg.service.enabled {
                let down = monitor.up < 0.5;
                let eval = RuleEval {
                    rule_key: format!("service:{}", monitor.monitor_id),
                    alert_type: "service",
                    value: if down { 1.0 } else { 0.0 },
                    threshold: 0.0,
                    duration_secs: cfg.service.duration,
                    breached: down,
                    message: format!(
                        "Monitor {} on {} is down",
                        monitor.monitor_id, agent.name
                    ),
                    level: "critical",
                };
                apply_rule(pool, notify, agent, eval, now_ms).await?;
            }
        }
    }

    Ok(())
}

fn threshold_eval(
    rule_key: &str,
    alert_type: &'static str,
    value: f64,
    rule: &ThresholdRule,
    level: &'static str,
    message: String,
) -> RuleEval {
    RuleEval {
        rule_key: rule_key.to_string(),
        alert_type,
        value,
        threshold: rule.threshold,
        duration_secs: rule.duration,
        breached: value > rule.threshold,
        message,
        level,
    }
}

pub fn network_mbps(rx_bytes_per_sec: f64, tx_bytes_per_sec: f64) -> f64 {
    (rx_bytes_per_sec + tx_bytes_per_sec) / MB
}

async fn apply_rule(
    pool: &PgPool,
    notify: &NotifyHandle,
    agent: &AgentRow,
    eval: RuleEval,
    now_ms: i64,
) -> Result<Action> {
    let state_key = format!("{}:{}:{}", agent.id, eval.rule_key, eval.alert_type);
    let existing: Option<AlertStateRow> = sqlx::query_as(
        r#"
        SELECT state_key, agent_id, value, threshold, duration_secs,
               start_time, last_check, is_firing, last_record_id
        FROM alert_states WHERE state_key = $1
    "#,
    )
    .bind(&state_key)
    .fetch_optional(pool)
    .await?;

    if let Some(st) = existing.as_ref() {
        tracing::debug!(
            state_key = %st.state_key,
            agent_id = %st.agent_id,
            value = st.value,
            threshold = st.threshold,
            duration = st.duration_secs,
            start_time = st.start_time,
            last_check = st.last_check,
            firing = st.is_firing,
            "alert state loaded"
        );
    }

    let action = next_action(existing.as_ref(), eval.breached, now_ms, eval.duration_secs);
    match action {
        Action::Ignore => {}
        Action::Track => {
            upsert_state(pool, &state_key, agent, &eval, now_ms, None).await?;
        }
        Action::Fire => {
            let record_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO alert_records
                    (agent_id, alert_type, message, threshold, actual_value, level, status, fired_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
            "#,
            )
            .bind(&agent.id)
            .bind(eval.alert_type)
            .bind(&eval.message)
            .bind(eval.threshold)
            .bind(eval.value)
            .bind(eval.level)
            .bind(ALERT_FIRING)
            .bind(now_ms)
            .fetch_one(pool)
            .await?;

            upsert_state(pool, &state_key, agent, &eval, now_ms, Some(record_id)).await?;
            notify.enqueue(alert_event(EventKind::AlertFiring, agent, &eval, now_ms));
        }
        Action::Resolve => {
            let record_id = existing.as_ref().map(|s| s.last_record_id).unwrap_or(0);
            if record_id == 0 {
                let violation =
                    crate::error::FleetError::StateViolation(format!(
                        "firing state {state_key} carries no record id"
                    ));
                error!("{violation}; clearing the state row");
            } else {
                let res = sqlx::query(
                    r#"
                    UPDATE alert_records
                    SET status = $2, resolved_at = $3, updated_at = now()
                    WHERE id = $1 AND status = $4
                "#,
                )
                .bind(record_id)
                .bind(ALERT_RESOLVED)
                .bind(now_ms)
                .bind(ALERT_FIRING)
                .execute(pool)
                .await?;
                if res.rows_affected() == 0 {
                    error!(state_key, record_id, "firing state pointed at a non-firing record");
                }
            }
            sqlx::query(r#"DELETE FROM alert_states WHERE state_key = $1"#)
                .bind(&state_key)
                .execute(pool)
                .await?;
            notify.enqueue(alert_event(EventKind::AlertResolved, agent, &eval, now_ms));
        }
        Action::Clear => {
            sqlx::query(r#"DELETE FROM alert_states WHERE state_key = $1"#)
                .bind(&state_key)
                .execute(pool)
                .await?;
        }
    }
    Ok(action)
}

/// Upsert the state row. An existing streak's `start_time` is
/// preserved; `record_id` is only written on the firing transition.
async fn upsert_state(
    pool: &PgPool,
    state_key: &str,
    agent: &AgentRow,
    eval: &RuleEval,
    now_ms: i64,
    record_id: Option<i64>,
) -> Result<()> {
    match record_id {
        None => {
            sqlx::query(
                r#"
                INSERT INTO alert_states
                    (state_key, agent_id, value, threshold, duration_secs, start_time, last_check)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (state_key) DO UPDATE SET
                    value = EXCLUDED.value,
                    threshold = EXCLUDED.threshold,
                    duration_secs = EXCLUDED.duration_secs,
                    start_time = CASE
                        WHEN alert_states.start_time > 0 THEN alert_states.start_time
                        ELSE EXCLUDED.start_time
                    END,
                    last_check = EXCLUDED.last_check,
                    updated_at = now()
            "#,
            )
            .bind(state_key)
            .bind(&agent.id)
            .bind(eval.value)
            .bind(eval.threshold)
            .bind(eval.duration_secs)
            .bind(now_ms)
            .bind(now_ms)
            .execute(pool)
            .await?;
        }
        Some(record_id) => {
            sqlx::query(
                r#"
                INSERT INTO alert_states
                    (state_key, agent_id, value, threshold, duration_secs, start_time, last_check,
                     is_firing, last_record_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, true, $8)
                ON CONFLICT (state_key) DO UPDATE SET
                    value = EXCLUDED.value,
                    threshold = EXCLUDED.threshold,
                    duration_secs = EXCLUDED.duration_secs,
                    start_time = CASE
                        WHEN alert_states.start_time > 0 THEN alert_states.start_time
                        ELSE EXCLUDED.start_time
                    END,
                    last_check = EXCLUDED.last_check,
                    is_firing = true,
                    last_record_id = EXCLUDED.last_record_id,
                    updated_at = now()
            "#,
            )
            .bind(state_key)
            .bind(&agent.id)
            .bind(eval.value)
            .bind(eval.threshold)
            .bind(eval.duration_secs)
            .bind(now_ms)
            .bind(now_ms)
            .bind(record_id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

fn alert_event(kind: EventKind, agent: &AgentRow, eval: &RuleEval, now_ms: i64) -> AlertEvent {
    AlertEvent {
        kind,
        agent_id: agent.id.clone(),
        agent_name: agent.name.clone(),
        alert_type: eval.alert_type.to_string(),
        message: eval.message.clone(),
        threshold: eval.threshold,
        value: eval.value,
        at_ms: now_ms,
    }
}

/// State rows that stopped being touched (rule disabled, partition
/// gone, agent deleted mid-scan) are garbage after a day.
async fn gc_stale_states(pool: &PgPool) -> Result<()> {
    sqlx::query(r#"DELETE FROM alert_states WHERE updated_at < now() - interval '24 hours'"#)
        .execute(pool)
        .await?;
    Ok(())
}

async fn latest_scalar(
    pool: &PgPool,
    table: &str,
    column: &str,
    agent_id: &str,
) -> Result<Option<f64>> {
    let sql = format!("SELECT {column} FROM {table} WHERE agent_id = $1 ORDER BY ts DESC LIMIT 1");
    let row: Option<(Option<f64>,)> = sqlx::query_as(&sql)
        .bind(agent_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.and_then(|r| r.0))
}

async fn latest_partitions(
    pool: &PgPool,
    table: &str,
    partition_column: &str,
    columns: &[&str],
    agent_id: &str,
) -> Result<Vec<(String, Vec<Option<f64>>)>> {
    let sql = format!(
        "SELECT DISTINCT ON ({part}) {part}, {cols} FROM {table} \
         WHERE agent_id = $1 ORDER BY {part}, ts DESC",
        part = partition_column,
        cols = columns.join(", "),
    );
    let rows = sqlx::query(&sql).bind(agent_id).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let partition: String = row.try_get(partition_column)?;
        let mut values = Vec::with_capacity(columns.len());
        for col in columns {
            values.push(row.try_get::<Option<f64>, _>(*col)?);
        }
        out.push((partition, values));
    }
    Ok(out)
}

struct MonitorLatest {
    monitor_id: String,
    up: f64,
    cert_days_left: Option<f64>,
}

async fn latest_monitors(pool: &PgPool, agent_id: &str) -> Result<Vec<MonitorLatest>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT ON (monitor_id) monitor_id, up, cert_days_left
        FROM monitor_results WHERE agent_id = $1
        ORDER BY monitor_id, ts DESC
    "#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(MonitorLatest {
            monitor_id: row.try_get("monitor_id")?,
            up: row.try_get::<Option<f64>, _>("up")?.unwrap_or(0.0),
            cert_days_left: row.try_get("cert_days_left")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(start_time: i64, is_firing: bool, last_record_id: i64) -> AlertStateRow {
        AlertStateRow {
            state_key: "a1:cpu:cpu".into(),
            agent_id: "a1".into(),
            value: 90.0,
            threshold: 80.0,
            duration_secs: 300,
            start_time,
            last_check: start_time,
            is_firing,
            last_record_id,
        }
    }

    #[test]
    fn no_state_no_breach_is_ignored() {
        assert_eq!(next_action(None, false, 1_000_000, 300), Action::Ignore);
    }

    #[test]
    fn first_breach_starts_a_streak() {
        assert_eq!(next_action(None, true, 1_000_000, 300), Action::Track);
    }

    #[test]
    fn zero_duration_fires_on_first_breach() {
        // The offline rule embeds its window in the threshold, so its
        // duration is zero and the first breached scan fires.
        assert_eq!(next_action(None, true, 1_000_000, 0), Action::Fire);
    }

    #[test]
    fn streak_below_duration_keeps_tracking() {
        let st = state(1_000_000, false, 0);
        assert_eq!(next_action(Some(&st), true, 1_000_000 + 299_000, 300), Action::Track);
    }

    #[test]
    fn streak_reaching_duration_fires() {
        let st = state(1_000_000, false, 0);
        assert_eq!(next_action(Some(&st), true, 1_000_000 + 300_000, 300), Action::Fire);
        assert_eq!(next_action(Some(&st), true, 1_000_000 + 400_000, 300), Action::Fire);
    }

    #[test]
    fn firing_state_keeps_tracking_while_breached() {
        let st = state(1_000_000, true, 7);
        assert_eq!(next_action(Some(&st), true, 2_000_000, 300), Action::Track);
    }

    #[test]
    fn firing_state_resolves_on_first_sample_back_in_bounds() {
        let st = state(1_000_000, true, 7);
        assert_eq!(next_action(Some(&st), false, 2_000_000, 300), Action::Resolve);
    }

    #[test]
    fn unfired_streak_clears_on_recovery() {
        let st = state(1_000_000, false, 0);
        assert_eq!(next_action(Some(&st), false, 1_100_000, 300), Action::Clear);
    }

    #[test]
    fn breach_then_recover_then_breach_restarts_the_clock() {
        // After a Clear the next breach sees no state: the streak
        // starts over instead of inheriting the old start time.
        let now = 10_000_000;
        assert_eq!(next_action(None, true, now, 300), Action::Track);
        let st = state(now, false, 0);
        assert_eq!(next_action(Some(&st), false, now + 10_000, 300), Action::Clear);
        assert_eq!(next_action(None, true, now + 20_000, 300), Action::Track);
    }

    #[test]
    fn cpu_breach_then_recovery_sequence() {
        // Threshold 80 for 300 s: breach held from t0 fires at
        // t0+300 s, the first sample back under resolves.
        let t0 = 1_700_000_000_000;
        let duration = 300;

        assert_eq!(next_action(None, true, t0, duration), Action::Track);
        let streak = state(t0, false, 0);
        assert_eq!(next_action(Some(&streak), true, t0 + 150_000, duration), Action::Track);
        assert_eq!(next_action(Some(&streak), true, t0 + 310_000, duration), Action::Fire);
        let firing = state(t0, true, 42);
        assert_eq!(next_action(Some(&firing), false, t0 + 340_000, duration), Action::Resolve);
    }

    #[test]
    fn network_threshold_is_in_megabytes() {
        assert_eq!(network_mbps(MB, MB), 2.0);
        assert!(network_mbps(512.0 * 1024.0, 0.0) < 1.0);
    }
}

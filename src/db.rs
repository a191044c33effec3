//! Pool setup, schema creation, and the agent-table operations. Other
//! tables are written by the subsystem that owns them (raw rows by the
//! ingester, aggregates by the rollup, alert rows by the alert engine,
//! properties by the property store).

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::metrics::KIND_SPECS;
use crate::models::{AgentRow, STATUS_OFFLINE, STATUS_ONLINE};

pub async fn connect_db(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("connecting to database")?;
    init_db(&pool).await?;
    Ok(pool)
}

pub async fn init_db(pool: &PgPool) -> Result<()> {
    // Create tables one statement at a time; some Postgres drivers
    // reject multi-command prepared statements.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id text PRIMARY KEY,
            name text NOT NULL,
            hostname text NOT NULL,
            os text NOT NULL DEFAULT '',
            arch text NOT NULL DEFAULT '',
            version text NOT NULL DEFAULT '',
            last_addr text NOT NULL DEFAULT '',
            public_ip text,
            status text NOT NULL DEFAULT 'offline',
            last_seen_at bigint NOT NULL DEFAULT 0,
            visibility text NOT NULL DEFAULT 'public',
            tags text,
            expires_at timestamptz,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating agents table")?;

    for spec in &KIND_SPECS {
        sqlx::query(&spec.raw_create_sql())
            .execute(pool)
            .await
            .with_context(|| format!("creating {} table", spec.raw_table))?;
        sqlx::query(&spec.raw_index_sql())
            .execute(pool)
            .await
            .with_context(|| format!("indexing {} table", spec.raw_table))?;
        sqlx::query(&spec.agg_create_sql())
            .execute(pool)
            .await
            .with_context(|| format!("creating {} table", spec.agg_table))?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregation_progress (
            metric_kind text NOT NULL,
            bucket_seconds bigint NOT NULL,
            last_bucket bigint NOT NULL,
            updated_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (metric_kind, bucket_seconds)
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating aggregation_progress table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_records (
            id bigserial PRIMARY KEY,
            agent_id text NOT NULL,
            alert_type text NOT NULL,
            message text NOT NULL,
            threshold double precision NOT NULL,
            actual_value double precision NOT NULL,
            level text NOT NULL,
            status text NOT NULL,
            fired_at bigint NOT NULL,
            resolved_at bigint,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating alert_records table")?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS alert_records_agent_idx ON alert_records (agent_id, fired_at DESC);"#,
    )
    .execute(pool)
    .await
    .context("indexing alert_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_states (
            state_key text PRIMARY KEY,
            agent_id text NOT NULL,
            value double precision NOT NULL,
            threshold double precision NOT NULL,
            duration_secs bigint NOT NULL,
            start_time bigint NOT NULL DEFAULT 0,
            last_check bigint NOT NULL DEFAULT 0,
            is_firing boolean NOT NULL DEFAULT false,
            last_record_id bigint NOT NULL DEFAULT 0,
            updated_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating alert_states table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            key text PRIMARY KEY,
            value jsonb NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating properties table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ssh_login_events (
            id bigserial PRIMARY KEY,
            agent_id text NOT NULL,
            username text NOT NULL,
            source_ip text NOT NULL,
            success boolean NOT NULL,
            method text,
            at bigint NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating ssh_login_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_results (
            id bigserial PRIMARY KEY,
            agent_id text NOT NULL,
            path text NOT NULL,
            change text NOT NULL,
            detail text,
            at bigint NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        );
    "#,
    )
    .execute(pool)
    .await
    .context("creating audit_results table")?;

    Ok(())
}

/// Registration upsert: refresh identity fields in place, flip to
/// online, preserve `created_at`.
pub async fn upsert_agent(
    pool: &PgPool,
    reg: &fleet_core::Register,
    peer: &str,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO agents (id, name, hostname, os, arch, version, last_addr, status, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            hostname = EXCLUDED.hostname,
            os = EXCLUDED.os,
            arch = EXCLUDED.arch,
            version = EXCLUDED.version,
            last_addr = EXCLUDED.last_addr,
            status = EXCLUDED.status,
            last_seen_at = EXCLUDED.last_seen_at,
            updated_at = now()
    "#,
    )
    .bind(&reg.agent_id)
    .bind(&reg.name)
    .bind(&reg.hostname)
    .bind(&reg.os)
    .bind(&reg.arch)
    .bind(&reg.version)
    .bind(peer)
    .bind(STATUS_ONLINE)
    .bind(now_ms)
    .execute(pool)
    .await
    .context("upserting agent row")?;
    Ok(())
}

/// Stamp `last_seen_at` for an inbound frame. Does not flip status by
/// itself; the alert scan owns the offline transition and the online
/// flip happens on register / resolve.
pub async fn touch_agent(pool: &PgPool, agent_id: &str, now_ms: i64) -> Result<()> {
    sqlx::query(r#"UPDATE agents SET last_seen_at = $2, updated_at = now() WHERE id = $1"#)
        .bind(agent_id)
        .bind(now_ms)
        .execute(pool)
        .await
        .context("stamping agent last_seen_at")?;
    Ok(())
}

pub async fn set_agent_status(pool: &PgPool, agent_id: &str, status: &str) -> Result<()> {
    sqlx::query(r#"UPDATE agents SET status = $2, updated_at = now() WHERE id = $1"#)
        .bind(agent_id)
        .bind(status)
        .execute(pool)
        .await
        .context("setting agent status")?;
    Ok(())
}

pub async fn set_agent_public_ip(pool: &PgPool, agent_id: &str, ip: &str) -> Result<()> {
    sqlx::query(r#"UPDATE agents SET public_ip = $2, updated_at = now() WHERE id = $1"#)
        .bind(agent_id)
        .bind(ip)
        .execute(pool)
        .await
        .context("setting agent public ip")?;
    Ok(())
}

/// Startup pass: every known agent starts offline and transitions back
/// on its first frame after reconnect.
pub async fn mark_all_agents_offline(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(r#"UPDATE agents SET status = $1, updated_at = now() WHERE status <> $1"#)
        .bind(STATUS_OFFLINE)
        .execute(pool)
        .await
        .context("marking agents offline at boot")?;
    Ok(res.rows_affected())
}

pub async fn get_agent(pool: &PgPool, agent_id: &str) -> Result<Option<AgentRow>> {
    let row = sqlx::query_as::<_, AgentRow>(r#"SELECT * FROM agents WHERE id = $1"#)
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .context("loading agent row")?;
    Ok(row)
}

pub async fn list_agents(pool: &PgPool) -> Result<Vec<AgentRow>> {
    let rows = sqlx::query_as::<_, AgentRow>(r#"SELECT * FROM agents ORDER BY name, id"#)
        .fetch_all(pool)
        .await
        .context("listing agent rows")?;
    Ok(rows)
}

/// Admin delete: one transaction removing the agent and every row it
/// owns across sample, aggregate, alert, and event tables.
pub async fn delete_agent(pool: &PgPool, agent_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("opening delete transaction")?;

    for spec in &KIND_SPECS {
        sqlx::query(&format!("DELETE FROM {} WHERE agent_id = $1", spec.raw_table))
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting {} rows", spec.raw_table))?;
        sqlx::query(&format!("DELETE FROM {} WHERE agent_id = $1", spec.agg_table))
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting {} rows", spec.agg_table))?;
    }
    for table in ["alert_records", "alert_states", "ssh_login_events", "audit_results"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE agent_id = $1"))
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting {table} rows"))?;
    }
    let res = sqlx::query(r#"DELETE FROM agents WHERE id = $1"#)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .context("deleting agent row")?;

    tx.commit().await.context("committing delete transaction")?;
    Ok(res.rows_affected() > 0)
}

pub async fn insert_ssh_login(
    pool: &PgPool,
    agent_id: &str,
    ev: &fleet_core::SshLoginEvent,
) -> Result<()> {
    let at = if ev.at > 0 { ev.at } else { Utc::now().timestamp_millis() };
    sqlx::query(
        r#"
        INSERT INTO ssh_login_events (agent_id, username, source_ip, success, method, at)
        VALUES ($1, $2, $3, $4, $5, $6)
    "#,
    )
    .bind(agent_id)
    .bind(&ev.username)
    .bind(&ev.source_ip)
    .bind(ev.success)
    .bind(&ev.method)
    .bind(at)
    .execute(pool)
    .await
    .context("inserting ssh login event")?;
    Ok(())
}

pub async fn insert_audit_result(
    pool: &PgPool,
    agent_id: &str,
    ev: &fleet_core::TamperEvent,
) -> Result<()> {
    let at = if ev.at > 0 { ev.at } else { Utc::now().timestamp_millis() };
    sqlx::query(
        r#"
        INSERT INTO audit_results (agent_id, path, change, detail, at)
        VALUES ($1, $2, $3, $4, $5)
    "#,
    )
    .bind(agent_id)
    .bind(&ev.path)
    .bind(&ev.change)
    .bind(&ev.detail)
    .bind(at)
    .execute(pool)
    .await
    .context("inserting audit result")?;
    Ok(())
}

//! Read API consumed by dashboards and admin tooling: the public
//! surface of the query planner plus alert records, properties, agent
//! administration, and the captured event streams.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::QueryBuilder;
use tracing::{error, warn};
use uuid::Uuid;

use crate::AppState;
use crate::db;
use crate::models::{AgentView, AlertRecordRow, AuditResultRow, PageQuery, PagedRecords, SshLoginRow};
use crate::query;
use crate::session::SendOutcome;
use fleet_core::{Command, Frame, MetricKind, frame_type};

const QUERY_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 200;

pub async fn healthz(State(state): State<AppState>) -> Response {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let online = state.sessions.session_count().await;
    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "db": db_ok, "online_agents": online }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub interval: Option<i64>,
}

/// `GET /metrics/{kind}` — adaptive raw/aggregate read.
pub async fn get_metrics(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<MetricsQuery>,
) -> Response {
    let Some(kind) = MetricKind::parse(&kind) else {
        return (StatusCode::BAD_REQUEST, format!("unknown metric kind {kind}")).into_response();
    };
    let now_ms = Utc::now().timestamp_millis();
    let start = params.start.unwrap_or(now_ms - 3_600_000);
    let end = params.end.unwrap_or(now_ms);
    let (retention_ms, _) = state.props.retention_ms(&state.cfg).await;

    let fetch = query::get_metrics(
        &state.pool,
        &params.agent_id,
        kind,
        start,
        end,
        params.interval.unwrap_or(0),
        retention_ms,
        state.cfg.max_query_points,
        now_ms,
    );
    match tokio::time::timeout(QUERY_DEADLINE, fetch).await {
        Ok(Ok(resp)) => Json(resp).into_response(),
        Ok(Err(err)) => {
            error!("metrics query failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(_) => {
            warn!("metrics query exceeded deadline");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// `GET /alerts/records` — paged, most recent first.
pub async fn list_alert_records(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    let page_index = page.page_index.unwrap_or(0).max(0);
    let page_size = page.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let mut count = QueryBuilder::new("SELECT count(*) FROM alert_records");
    if let Some(agent_id) = &page.agent_id {
        count.push(" WHERE agent_id = ").push_bind(agent_id);
    }
    let total: Result<i64, _> = count.build_query_scalar().fetch_one(&state.pool).await;

    let mut rows = QueryBuilder::new(
        "SELECT id, agent_id, alert_type, message, threshold, actual_value, level, status, fired_at, resolved_at FROM alert_records",
    );
    if let Some(agent_id) = &page.agent_id {
        rows.push(" WHERE agent_id = ").push_bind(agent_id);
    }
    rows.push(" ORDER BY fired_at DESC, id DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind(page_index * page_size);
    let records: Result<Vec<AlertRecordRow>, _> =
        rows.build_query_as().fetch_all(&state.pool).await;

    match (total, records) {
        (Ok(total), Ok(records)) => {
            Json(PagedRecords { total, page_index, page_size, records }).into_response()
        }
        (Err(err), _) | (_, Err(err)) => {
            error!("alert record query failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `DELETE /alerts/records` — truncate, all or per agent.
pub async fn delete_alert_records(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    let res = match &page.agent_id {
        Some(agent_id) => {
            sqlx::query("DELETE FROM alert_records WHERE agent_id = $1")
                .bind(agent_id)
                .execute(&state.pool)
                .await
        }
        None => sqlx::query("DELETE FROM alert_records").execute(&state.pool).await,
    };
    match res {
        Ok(done) => Json(json!({ "deleted": done.rows_affected() })).into_response(),
        Err(err) => {
            error!("alert record delete failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_property(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.props.get(&id).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(key = id, "property read failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn put_property(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(value): Json<Value>,
) -> Response {
    match state.props.set(&id, value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!(key = id, "property write failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn list_agents(State(state): State<AppState>) -> Response {
    match db::list_agents(&state.pool).await {
        Ok(rows) => {
            let online = state.sessions.online().await;
            let views: Vec<AgentView> = rows
                .into_iter()
                .map(|row| {
                    let connected = online.contains(&row.id);
                    AgentView::from_row(row, connected)
                })
                .collect();
            Json(views).into_response()
        }
        Err(err) => {
            error!("agent list failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match db::get_agent(&state.pool, &id).await {
        Ok(Some(row)) => {
            let connected = state.sessions.is_connected(&row.id).await;
            Json(AgentView::from_row(row, connected)).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(agent_id = id, "agent read failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Admin delete cascades to every row the agent owns.
pub async fn delete_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match db::delete_agent(&state.pool, &id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(agent_id = id, "agent delete failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandSubmit {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// `POST /agents/{id}/command` — fire-and-forget push; the reply
/// arrives later as a `command_response` frame.
pub async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(submit): Json<CommandSubmit>,
) -> Response {
    let command = Command {
        id: Uuid::new_v4(),
        command_type: submit.command_type,
        payload: submit.payload,
    };
    let frame = Frame::from_payload(frame_type::COMMAND, &command);
    let now_ms = Utc::now().timestamp_millis();

    match state.sessions.send_to_agent(&id, frame).await {
        SendOutcome::Sent => {
            state.sessions.track_command(&id, &command, now_ms).await;
            (StatusCode::ACCEPTED, Json(json!({ "id": command.id }))).into_response()
        }
        SendOutcome::Dropped => {
            (StatusCode::SERVICE_UNAVAILABLE, "outbound queue full").into_response()
        }
        SendOutcome::NotConnected => {
            (StatusCode::SERVICE_UNAVAILABLE, "agent not connected").into_response()
        }
    }
}

pub async fn get_command(
    State(state): State<AppState>,
    Path((_id, cmd_id)): Path<(String, Uuid)>,
) -> Response {
    match state.sessions.command_state(cmd_id).await {
        Some(cmd) => Json(cmd).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn list_ssh_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    list_events::<SshLoginRow>(
        &state,
        "SELECT id, agent_id, username, source_ip, success, method, at FROM ssh_login_events",
        page,
    )
    .await
}

pub async fn list_audit_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    list_events::<AuditResultRow>(
        &state,
        "SELECT id, agent_id, path, change, detail, at FROM audit_results",
        page,
    )
    .await
}

async fn list_events<T>(state: &AppState, base: &str, page: PageQuery) -> Response
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + serde::Serialize + Send + Unpin,
{
    let page_index = page.page_index.unwrap_or(0).max(0);
    let page_size = page.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let mut rows = QueryBuilder::new(base);
    if let Some(agent_id) = &page.agent_id {
        rows.push(" WHERE agent_id = ").push_bind(agent_id);
    }
    rows.push(" ORDER BY at DESC, id DESC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind(page_index * page_size);

    match rows.build_query_as::<T>().fetch_all(&state.pool).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            error!("event query failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

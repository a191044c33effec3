//! The agent channel: a long-lived WebSocket carrying JSON frames in
//! both directions. The handshake presents an API token (compared as a
//! sha256 digest against the configured store); an invalid token is
//! rejected before any state is created. After the upgrade the first
//! frame must be `register` — that is when the session attaches to the
//! manager and the agent row is refreshed.
//!
//! Each session runs one outbound-writer task draining its bounded
//! queue and one inbound loop dispatching frames in arrival order.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::config::hash_token;
use crate::db;
use crate::error::FleetError;
use fleet_core::{Frame, MetricKind, Register, frame_type};

/// The register frame must arrive this quickly after the upgrade.
const REGISTER_DEADLINE: Duration = Duration::from_secs(30);
/// Per-frame ingest deadline.
const INGEST_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub token: Option<String>,
}

/// `GET /agent/ws` — agent channel upgrade.
pub async fn agent_ws(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Query(query): Query<AgentWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or(query.token);
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    if !token_accepted(&state.token_digests, &token) {
        let err = FleetError::Auth("agent token not in the store".to_string());
        warn!(peer = %addr, "rejecting handshake: {err}");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    let peer = addr.to_string();
    ws.on_upgrade(move |socket| handle_socket(state, socket, peer))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

pub fn token_accepted(digests: &[String], token: &str) -> bool {
    let digest = hash_token(token);
    digests.iter().any(|d| *d == digest)
}

async fn handle_socket(state: AppState, socket: WebSocket, peer: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Identity comes from the first frame.
    let reg = match wait_for_register(&mut ws_rx).await {
        Some(reg) => reg,
        None => {
            warn!(peer, "agent closed or misbehaved before registering");
            return;
        }
    };
    let agent_id = reg.agent_id.clone();
    let now_ms = Utc::now().timestamp_millis();
    if let Err(err) = db::upsert_agent(&state.pool, &reg, &peer, now_ms).await {
        warn!(agent_id, "registration write failed, dropping session: {err}");
        return;
    }

    let (handle, mut outbound) = state.sessions.attach(&agent_id, &peer).await;
    info!(agent_id, peer, hostname = %reg.hostname, "agent connected");

    // Outbound writer: drains the session queue until the session is
    // replaced or the queue closes.
    let write_cancel = handle.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.encode().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = ws_tx.close().await;
    });

    // Inbound loop: frames are processed in arrival order.
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                debug!(agent_id, "session cancelled");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch_raw(&state, &agent_id, &peer, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(agent_id, "agent transport error: {err}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.sessions.detach(&agent_id, handle.session_id).await;
    writer.abort();
    info!(agent_id, peer, "agent disconnected");
}

async fn wait_for_register(
    ws_rx: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Register> {
    let deadline = tokio::time::timeout(REGISTER_DEADLINE, async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Text(text) = msg {
                let frame = match Frame::decode(text.as_str()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("undecodable first frame: {err}");
                        return None;
                    }
                };
                if frame.kind != frame_type::REGISTER {
                    warn!(frame_type = %frame.kind, "first frame was not register");
                    return None;
                }
                return serde_json::from_value::<Register>(frame.data)
                    .map_err(|err| warn!("malformed register payload: {err}"))
                    .ok();
            }
        }
        None
    });
    deadline.await.ok().flatten()
}

async fn dispatch_raw(state: &AppState, agent_id: &str, peer: &str, raw: &str) {
    let now_ms = Utc::now().timestamp_millis();
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(agent_id, "dropping undecodable frame: {err}");
            return;
        }
    };

    // Every frame proves liveness.
    if let Err(err) = db::touch_agent(&state.pool, agent_id, now_ms).await {
        warn!(agent_id, "failed to stamp last_seen: {err}");
    }

    if let Err(err) = dispatch_frame(state, agent_id, peer, frame, now_ms).await {
        match err {
            FleetError::BadInput(msg) => warn!(agent_id, "dropping bad frame: {msg}"),
            err => warn!(agent_id, "frame handling failed: {err}"),
        }
    }
}

async fn dispatch_frame(
    state: &AppState,
    agent_id: &str,
    peer: &str,
    frame: Frame,
    now_ms: i64,
) -> crate::error::Result<()> {
    match frame.kind.as_str() {
        frame_type::REGISTER => {
            let reg: Register = serde_json::from_value(frame.data)?;
            if reg.agent_id != agent_id {
                return Err(FleetError::BadInput(format!(
                    "re-register changed agent id ({} -> {})",
                    agent_id, reg.agent_id
                )));
            }
            db::upsert_agent(&state.pool, &reg, peer, now_ms).await?;
        }
        frame_type::HEARTBEAT => {
            // Arrival already stamped last_seen; nothing else to do.
        }
        frame_type::COMMAND_RESPONSE => {
            let resp: fleet_core::CommandResponse = serde_json::from_value(frame.data)?;
            debug!(agent_id, command_id = %resp.id, status = ?resp.status, "command response");
            state.sessions.resolve_command(&resp).await;
        }
        frame_type::SSH_LOGIN_EVENT => {
            let ev: fleet_core::SshLoginEvent = serde_json::from_value(frame.data)?;
            db::insert_ssh_login(&state.pool, agent_id, &ev).await?;
            state.notify.enqueue(ssh_event(state, agent_id, &ev, now_ms).await);
        }
        frame_type::TAMPER_EVENT => {
            let ev: fleet_core::TamperEvent = serde_json::from_value(frame.data)?;
            db::insert_audit_result(&state.pool, agent_id, &ev).await?;
            state.notify.enqueue(tamper_event(state, agent_id, &ev, now_ms).await);
        }
        kind if kind.starts_with(frame_type::METRIC_PREFIX) => {
            let metric = &kind[frame_type::METRIC_PREFIX.len()..];
            let Some(metric) = MetricKind::parse(metric) else {
                return Err(FleetError::BadInput(format!("unknown metric kind {metric}")));
            };
            tokio::time::timeout(
                INGEST_DEADLINE,
                crate::ingest::handle_metric(&state.pool, agent_id, metric, frame.data, now_ms),
            )
            .await
            .map_err(|_| anyhow::anyhow!("ingest deadline exceeded for {kind}"))
            .map_err(FleetError::from)??;
        }
        other => {
            warn!(agent_id, frame_type = other, "ignoring unknown frame type");
        }
    }
    Ok(())
}

async fn agent_display_name(state: &AppState, agent_id: &str) -> String {
    match db::get_agent(&state.pool, agent_id).await {
        Ok(Some(agent)) => agent.name,
        _ => agent_id.to_string(),
    }
}

async fn ssh_event(
    state: &AppState,
    agent_id: &str,
    ev: &fleet_core::SshLoginEvent,
    now_ms: i64,
) -> crate::notify::AlertEvent {
    let name = agent_display_name(state, agent_id).await;
    let outcome = if ev.success { "accepted" } else { "failed" };
    crate::notify::AlertEvent {
        kind: crate::notify::EventKind::SshLogin,
        agent_id: agent_id.to_string(),
        agent_name: name.clone(),
        alert_type: "ssh_login".to_string(),
        message: format!("SSH login {outcome} on {name}: {} from {}", ev.username, ev.source_ip),
        threshold: 0.0,
        value: 0.0,
        at_ms: if ev.at > 0 { ev.at } else { now_ms },
    }
}

async fn tamper_event(
    state: &AppState,
    agent_id: &str,
    ev: &fleet_core::TamperEvent,
    now_ms: i64,
) -> crate::notify::AlertEvent {
    let name = agent_display_name(state, agent_id).await;
    crate::notify::AlertEvent {
        kind: crate::notify::EventKind::Tamper,
        agent_id: agent_id.to_string(),
        agent_name: name.clone(),
        alert_type: "tamper".to_string(),
        message: format!("File change on {name}: {} ({})", ev.path, ev.change),
        threshold: 0.0,
        value: 0.0,
        at_ms: if ev.at > 0 { ev.at } else { now_ms },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_digest_comparison() {
        let digests = vec![hash_token("good-token")];
        assert!(token_accepted(&digests, "good-token"));
        assert!(!token_accepted(&digests, "bad-token"));
        assert!(!token_accepted(&[], "good-token"));
    }

    #[test]
    fn bearer_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}

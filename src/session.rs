//! Live-session registry: `agent_id → session`. The accept path and
//! the close path are the only writers; everyone else takes a snapshot
//! through the read lock. Reconnects win: attaching over an existing
//! session cancels the old one first.
//!
//! Also tracks in-flight command round-trips so the read API can
//! report what an agent answered.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::CommandState;
use fleet_core::{Command, CommandResponse, Frame};

/// Tracked commands are dropped after this long without an answer.
const COMMAND_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendOutcome {
    Sent,
    /// Outbound queue full; the frame was dropped. Callers do not
    /// retry — the next scheduled tick sends fresh state anyway.
    Dropped,
    NotConnected,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub tx: mpsc::Sender<Frame>,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    /// Cancelled when a newer session takes over this agent id or the
    /// server shuts down.
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    commands: Arc<RwLock<HashMap<Uuid, CommandState>>>,
    queue_capacity: usize,
}

impl SessionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            commands: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a session for an authenticated agent. Last writer
    /// wins: any existing session for the same id is cancelled.
    pub async fn attach(&self, agent_id: &str, peer: &str) -> (SessionHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = SessionHandle {
            session_id: Uuid::new_v4(),
            tx,
            peer: peer.to_string(),
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
        };

        let old = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(agent_id.to_string(), handle.clone())
        };
        if let Some(old) = old {
            info!(agent_id, old_peer = %old.peer, "replacing existing session");
            old.cancel.cancel();
        }
        (handle, rx)
    }

    /// Remove a session on close. The `session_id` guard keeps a stale
    /// close (from a session that was already replaced) from tearing
    /// down its successor.
    pub async fn detach(&self, agent_id: &str, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(agent_id).is_some_and(|s| s.session_id == session_id) {
            sessions.remove(agent_id);
        }
    }

    /// Non-blocking enqueue onto the agent's outbound queue.
    pub async fn send_to_agent(&self, agent_id: &str, frame: Frame) -> SendOutcome {
        let tx = {
            let sessions = self.sessions.read().await;
            match sessions.get(agent_id) {
                Some(s) => s.tx.clone(),
                None => return SendOutcome::NotConnected,
            }
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(agent_id, frame_type = %frame.kind, "outbound queue full, dropping frame");
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotConnected,
        }
    }

    /// Fan out per-agent frames, e.g. the public-IP config push.
    pub async fn broadcast(&self, frames: HashMap<String, Frame>) {
        for (agent_id, frame) in frames {
            self.send_to_agent(&agent_id, frame).await;
        }
    }

    /// Snapshot of the connected agent ids.
    pub async fn online(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.read().await.contains_key(agent_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every live session; used at shutdown.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            handle.cancel.cancel();
        }
    }

    // --- command round-trips ---

    pub async fn track_command(&self, agent_id: &str, command: &Command, now_ms: i64) {
        let mut commands = self.commands.write().await;
        commands.retain(|_, c| now_ms - c.issued_at < COMMAND_TTL_MS);
        commands.insert(
            command.id,
            CommandState {
                id: command.id,
                agent_id: agent_id.to_string(),
                command_type: command.command_type.clone(),
                status: "pending".to_string(),
                result: None,
                error: None,
                issued_at: now_ms,
            },
        );
    }

    /// Apply a `command_response` frame to the tracked entry. Unknown
    /// ids are ignored (the entry may have expired).
    pub async fn resolve_command(&self, resp: &CommandResponse) {
        let mut commands = self.commands.write().await;
        match commands.get_mut(&resp.id) {
            Some(entry) => {
                entry.status = match resp.status {
                    fleet_core::CommandStatus::Running => "running".to_string(),
                    fleet_core::CommandStatus::Success => "success".to_string(),
                    fleet_core::CommandStatus::Error => "error".to_string(),
                };
                entry.result = resp.result.clone();
                entry.error = resp.error.clone();
            }
            None => warn!(command_id = %resp.id, "response for unknown command"),
        }
    }

    pub async fn command_state(&self, id: Uuid) -> Option<CommandState> {
        self.commands.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame() -> Frame {
        Frame::new("command", json!({"id": "x"}))
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let mgr = SessionManager::new(4);
        assert_eq!(mgr.send_to_agent("a1", frame()).await, SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn attach_send_receive() {
        let mgr = SessionManager::new(4);
        let (_handle, mut rx) = mgr.attach("a1", "10.0.0.1:555").await;
        assert_eq!(mgr.send_to_agent("a1", frame()).await, SendOutcome::Sent);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, "command");
        assert_eq!(mgr.online().await, vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn reconnect_cancels_old_session() {
        let mgr = SessionManager::new(4);
        let (old, _old_rx) = mgr.attach("a1", "10.0.0.1:555").await;
        assert!(!old.cancel.is_cancelled());

        let (new, mut new_rx) = mgr.attach("a1", "10.0.0.2:555").await;
        old.cancel.cancelled().await;
        assert_ne!(old.session_id, new.session_id);

        // Frames now land on the new session only.
        assert_eq!(mgr.send_to_agent("a1", frame()).await, SendOutcome::Sent);
        assert!(new_rx.recv().await.is_some());
        assert_eq!(mgr.session_count().await, 1);
    }

    #[tokio::test]
    async fn stale_detach_does_not_remove_successor() {
        let mgr = SessionManager::new(4);
        let (old, _old_rx) = mgr.attach("a1", "p1").await;
        let (_new, _new_rx) = mgr.attach("a1", "p2").await;
        mgr.detach("a1", old.session_id).await;
        assert!(mgr.is_connected("a1").await);
    }

    #[tokio::test]
    async fn full_queue_drops_frame() {
        let mgr = SessionManager::new(1);
        let (_handle, _rx) = mgr.attach("a1", "p").await;
        assert_eq!(mgr.send_to_agent("a1", frame()).await, SendOutcome::Sent);
        // Queue capacity 1, nothing draining: the second send drops.
        assert_eq!(mgr.send_to_agent("a1", frame()).await, SendOutcome::Dropped);
    }

    #[tokio::test]
    async fn command_round_trip_tracking() {
        let mgr = SessionManager::new(4);
        let cmd = Command {
            id: Uuid::new_v4(),
            command_type: "restart_service".to_string(),
            payload: json!({"name": "nginx"}),
        };
        mgr.track_command("a1", &cmd, 1_000).await;
        assert_eq!(mgr.command_state(cmd.id).await.unwrap().status, "pending");

        mgr.resolve_command(&CommandResponse {
            id: cmd.id,
            command_type: "restart_service".to_string(),
            status: fleet_core::CommandStatus::Success,
            result: Some(json!({"exit_code": 0})),
            error: None,
        })
        .await;
        let state = mgr.command_state(cmd.id).await.unwrap();
        assert_eq!(state.status, "success");
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn expired_commands_are_pruned() {
        let mgr = SessionManager::new(4);
        let old = Command { id: Uuid::new_v4(), command_type: "c".into(), payload: json!(null) };
        mgr.track_command("a1", &old, 0).await;
        let fresh = Command { id: Uuid::new_v4(), command_type: "c".into(), payload: json!(null) };
        mgr.track_command("a1", &fresh, COMMAND_TTL_MS + 1).await;
        assert!(mgr.command_state(old.id).await.is_none());
        assert!(mgr.command_state(fresh.id).await.is_some());
    }
}

//! The long-running loops: rollup, retention, alert scan, public-IP
//! push. Each owns one responsibility, runs its tick to completion
//! before sleeping (single-flight), and exits on the root shutdown
//! signal. An irrecoverable database error is reported upward so the
//! process can exit with code 2 instead of spinning.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::AppState;
use crate::error::FleetError;
use crate::{alert, rollup};
use fleet_core::{Frame, frame_type};

const ROLLUP_PERIOD: Duration = Duration::from_secs(60);
const RETENTION_PERIOD: Duration = Duration::from_secs(60);
const MIN_PUSH_PERIOD: u64 = 10;

pub fn spawn_loops(
    state: AppState,
    shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<String>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_rollup(state.clone(), shutdown.clone(), fatal.clone()),
        spawn_retention(state.clone(), shutdown.clone(), fatal.clone()),
        spawn_alert_scan(state.clone(), shutdown.clone(), fatal),
        spawn_public_ip_push(state, shutdown),
    ]
}

fn report(fatal: &mpsc::Sender<String>, loop_name: &str, err: &FleetError) -> bool {
    if err.is_irrecoverable_db() {
        let _ = fatal.try_send(format!("{loop_name}: {err}"));
        true
    } else {
        warn!("{loop_name} tick failed: {err}");
        false
    }
}

fn spawn_rollup(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ROLLUP_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now_ms = Utc::now().timestamp_millis();
                    let (retention_ms, _) = state.props.retention_ms(&state.cfg).await;
                    if let Err(err) =
                        rollup::rollup_tick(&state.pool, retention_ms, now_ms).await
                    {
                        if report(&fatal, "rollup", &err) {
                            break;
                        }
                    }
                }
            }
        }
        info!("rollup loop stopped");
    })
}

fn spawn_retention(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now_ms = Utc::now().timestamp_millis();
                    let (retention_ms, agg_retention_ms) =
                        state.props.retention_ms(&state.cfg).await;
                    if let Err(err) = rollup::retention_tick(
                        &state.pool,
                        retention_ms,
                        agg_retention_ms,
                        now_ms,
                    )
                    .await
                    {
                        if report(&fatal, "retention", &err) {
                            break;
                        }
                    }
                }
            }
        }
        info!("retention loop stopped");
    })
}

/// The scan period follows the configured offline window (a tenth,
/// clamped to [5 s, 60 s]) and is re-read every iteration so config
/// changes take effect without a restart.
fn spawn_alert_scan(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = state.props.alert_config().await.scan_period_secs();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(period)) => {
                    let now_ms = Utc::now().timestamp_millis();
                    if let Err(err) =
                        alert::scan_tick(&state.pool, &state.props, &state.notify, now_ms).await
                    {
                        if report(&fatal, "alert scan", &err) {
                            break;
                        }
                    }
                }
            }
        }
        info!("alert scan loop stopped");
    })
}

fn spawn_public_ip_push(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let cfg = state.props.public_ip_config().await;
            let period = cfg.interval_seconds.max(MIN_PUSH_PERIOD);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(period)) => {
                    if !cfg.enabled {
                        continue;
                    }
                    let frame = Frame::from_payload(frame_type::PUBLIC_IP_CONFIG, &cfg);
                    let frames: HashMap<String, Frame> = state
                        .sessions
                        .online()
                        .await
                        .into_iter()
                        .map(|agent_id| (agent_id, frame.clone()))
                        .collect();
                    state.sessions.broadcast(frames).await;
                }
            }
        }
        info!("public-ip push loop stopped");
    })
}

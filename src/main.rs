//! Headend for the host-fleet monitoring platform.
//! - Accepts long-lived agent WebSocket sessions (token handshake,
//!   JSON frames) and ingests their metric samples into Postgres.
//! - Rolls raw samples up into fixed-width aggregate buckets and
//!   enforces retention.
//! - Evaluates threshold alert rules, persists firing/resolved
//!   records, and fans out notifications.
//! - Serves the read API for dashboards.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod alert;
mod config;
mod db;
mod error;
mod http;
mod ingest;
mod metrics;
mod models;
mod notify;
mod property;
mod query;
mod rollup;
mod scheduler;
mod session;
mod ws;

use config::FleetConfig;
use notify::NotifyHandle;
use property::PropertyStore;
use session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cfg: Arc<FleetConfig>,
    pub token_digests: Arc<Vec<String>>,
    pub sessions: SessionManager,
    pub props: PropertyStore,
    pub notify: NotifyHandle,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("startup failed: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cfg = FleetConfig::load().await?;
    cfg.validate()?;
    let cfg = Arc::new(cfg);

    let pool = db::connect_db(cfg.database_url.as_deref().unwrap_or_default()).await?;

    let props = PropertyStore::new(pool.clone());
    props.init_defaults().await?;

    // Every agent starts offline; the first frame after reconnect
    // flips it back.
    let reset = db::mark_all_agents_offline(&pool).await?;
    if reset > 0 {
        info!(agents = reset, "marked agents offline at boot");
    }

    let sessions = SessionManager::new(cfg.outbound_queue);
    let (notify_handle, notify_worker) = notify::spawn(props.clone());

    let state = AppState {
        pool: pool.clone(),
        cfg: cfg.clone(),
        token_digests: Arc::new(cfg.token_digests()),
        sessions: sessions.clone(),
        props,
        notify: notify_handle,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(4);
    let loops = scheduler::spawn_loops(state.clone(), shutdown_rx.clone(), fatal_tx);

    let app = Router::new()
        .route("/healthz", get(http::healthz))
        .route("/agent/ws", get(ws::agent_ws))
        .route("/metrics/{kind}", get(http::get_metrics))
        .route(
            "/alerts/records",
            get(http::list_alert_records).delete(http::delete_alert_records),
        )
        .route("/properties/{id}", get(http::get_property).put(http::put_property))
        .route("/agents", get(http::list_agents))
        .route("/agents/{id}", get(http::get_agent).delete(http::delete_agent))
        .route("/agents/{id}/command", post(http::send_command))
        .route("/agents/{id}/command/{cmd_id}", get(http::get_command))
        .route("/events/ssh", get(http::list_ssh_events))
        .route("/events/audit", get(http::list_audit_events))
        .with_state(state.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        path = %req.uri().path(),
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::debug!(
                            status = %res.status(),
                            latency_ms = %latency.as_millis(),
                            "response sent"
                        );
                    },
                ),
        );

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!("headend listening on {}", cfg.listen_addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    // Run until a signal or an irrecoverable database error.
    let mut exit_code = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        msg = fatal_rx.recv() => {
            if let Some(msg) = msg {
                error!("irrecoverable database error: {msg}");
                exit_code = ExitCode::from(2);
            }
        }
    }

    // Ordered teardown: stop the loops and the listener, close the
    // agent sessions so their handlers return, then wait everything
    // out within the grace period.
    let _ = shutdown_tx.send(true);
    sessions.close_all().await;

    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!("server exited with error: {err}"),
        Ok(Err(err)) => warn!("server task panicked: {err}"),
        Err(_) => warn!("server did not stop within grace period"),
    }

    for handle in loops {
        match tokio::time::timeout(grace, handle).await {
            Ok(_) => {}
            Err(_) => warn!("background loop abandoned after grace period"),
        }
    }

    // Dropping the last notify handle lets the worker drain and exit.
    drop(state);
    if tokio::time::timeout(grace, notify_worker).await.is_err() {
        warn!("notifier abandoned after grace period");
    }

    pool.close().await;
    info!("shutdown complete");
    Ok(exit_code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

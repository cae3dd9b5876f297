use crate::{
    browser::BrowserMirror,
    messages::{BrowserEvent, ContentEnvelope},
    storage::Storage,
    tracking::{
        SessionController, TrackingSettings,
        active::ActiveSession,
        daily::{DailyStats, SessionEntry},
    },
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};

pub type SharedController = Arc<Mutex<SessionController<BrowserMirror>>>;

#[derive(Clone)]
pub struct ServerState {
    controller: SharedController,
    storage: Storage,
}

impl ServerState {
    pub fn new(controller: SharedController, storage: Storage) -> Self {
        Self {
            controller,
            storage,
        }
    }
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .route("/messages", post(post_message))
        .route("/stats", get(get_all_stats))
        .route("/stats/:date", get(get_day_stats))
        .route("/stats/:date/sessions", get(get_day_sessions))
        .route("/sessions/active", get(get_active_sessions))
        .route("/settings", get(get_settings))
        .with_state(state)
}

pub async fn spawn(listen_addr: &str, state: ServerState) -> Result<ServerHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| "failed to parse listen_addr")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind event listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(state);
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "event listener started");

    Ok(ServerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn post_event(
    State(state): State<ServerState>,
    Json(event): Json<BrowserEvent>,
) -> StatusCode {
    let mut controller = state.controller.lock().await;
    match controller.handle_event(event, now_ms()).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            tracing::warn!(error = %err, "failed to apply browser event");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn post_message(
    State(state): State<ServerState>,
    Json(envelope): Json<ContentEnvelope>,
) -> StatusCode {
    let tab_id = envelope.sender.tab_id;
    let mut controller = state.controller.lock().await;
    match controller.handle_message(envelope, now_ms()).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            tracing::warn!(error = %err, tab_id, "failed to apply content message");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_all_stats(
    State(state): State<ServerState>,
) -> Result<Json<BTreeMap<NaiveDate, DailyStats>>, StatusCode> {
    let days = state.storage.all_days().await.map_err(internal_error)?;
    Ok(Json(
        days.into_iter().map(|stats| (stats.date, stats)).collect(),
    ))
}

async fn get_day_stats(
    State(state): State<ServerState>,
    Path(date): Path<String>,
) -> Result<Json<DailyStats>, StatusCode> {
    let date = parse_date(&date)?;
    match state.storage.load_day(date).await.map_err(internal_error)? {
        Some(stats) => Ok(Json(stats)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    domain: Option<String>,
}

async fn get_day_sessions(
    State(state): State<ServerState>,
    Path(date): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Vec<SessionEntry>>, StatusCode> {
    let date = parse_date(&date)?;
    let Some(stats) = state.storage.load_day(date).await.map_err(internal_error)? else {
        return Ok(Json(Vec::new()));
    };
    let entries = match query.domain.as_deref() {
        Some(domain) => stats.domain_entries(domain),
        None => stats.session_entries(),
    };
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
struct ActiveStatus {
    idle: bool,
    sessions: Vec<ActiveSession>,
}

async fn get_active_sessions(State(state): State<ServerState>) -> Json<ActiveStatus> {
    let controller = state.controller.lock().await;
    Json(ActiveStatus {
        idle: controller.is_idle(),
        sessions: controller.active_sessions(),
    })
}

async fn get_settings(State(state): State<ServerState>) -> Json<TrackingSettings> {
    Json(state.controller.lock().await.settings())
}

fn parse_date(raw: &str) -> Result<NaiveDate, StatusCode> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)
}

fn internal_error(err: anyhow::Error) -> StatusCode {
    tracing::error!(error = %err, "stats query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

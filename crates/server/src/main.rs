use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use feed_client::{FeedClient, FeedConfig, HttpSubscriptionApi, TokioClock};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        ConnectionStatus, EventCategory, IncrementSettings, SettingsUpdate, ThemeSettings,
        TimerState,
    },
    error::{ApiError, ErrorCode},
    protocol::UiEvent,
};
use storage::Storage;
use timer_core::TimerEngine;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod controller;
mod overlay;

use app_state::AppState;
use config::load_settings;
use controller::{load_increments, ControllerClosed, TimerCommand, TimerController};
use overlay::{listen, BroadcastHub};

/// Countdown timer fed by live audience events, mirrored to overlay clients.
#[derive(Debug, Parser)]
#[command(name = "marathon-timer", version)]
struct Args {
    /// TOML settings file; `timer.toml` is read when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Broadcast listener port.
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding the timer, theme and increment documents.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SetTimeRequest {
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct AddTimeRequest {
    seconds: f64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    feed: ConnectionStatus,
    overlay_clients: usize,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(port) = args.port {
        settings.broadcast_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    settings.validate()?;

    let storage = Storage::open(settings.data_dir.clone()).with_context(|| {
        format!(
            "failed to open data directory '{}'",
            settings.data_dir.display()
        )
    })?;
    let engine = TimerEngine::load(storage.clone());
    let theme = match storage.load_theme() {
        Ok(theme) => theme.unwrap_or_default(),
        Err(error) => {
            warn!(%error, "failed to load theme settings; using defaults");
            ThemeSettings::default()
        }
    };
    let hub = Arc::new(BroadcastHub::new(
        storage.clone(),
        theme,
        Some(engine.state()),
    ));
    let (ui, _) = broadcast::channel(256);
    tokio::spawn(log_ui_events(ui.subscribe()));

    let (feed, feed_events, feed_status) = match settings.credential() {
        Some(credential) => {
            let (client, events) = FeedClient::spawn(
                FeedConfig {
                    endpoint: settings.feed_ws_url.clone(),
                    categories: EventCategory::ALL.to_vec(),
                    retry: settings.retry_policy(),
                    ..FeedConfig::default()
                },
                Arc::new(HttpSubscriptionApi::new(settings.feed_api_url.clone())),
                Arc::new(TokioClock),
            );
            let status = client.watch_status();
            client.connect(credential);
            (Some(client), Some(events), status)
        }
        None => {
            warn!("feed credentials incomplete; running without the event feed");
            let (_, status) = watch::channel(ConnectionStatus::Disconnected);
            (None, None, status)
        }
    };

    let timer = TimerController::new(
        engine,
        load_increments(&storage),
        storage,
        Arc::clone(&hub),
        ui.clone(),
        settings.tick_interval(),
    )
    .spawn(feed_events);

    let state = Arc::new(AppState {
        hub,
        timer,
        ui,
        feed_status,
    });

    match listen(&settings.broadcast_host, settings.broadcast_port).await {
        Ok(listener) => {
            info!(addr = %listener.local_addr()?, "broadcast server listening");
            axum::serve(listener, build_router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Err(error) => {
            warn!(%error, "broadcast disabled for this run");
            shutdown_signal().await;
        }
    }

    if let Some(feed) = feed {
        info!("closing feed session");
        feed.disconnect().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn log_ui_events(mut events: broadcast::Receiver<UiEvent>) {
    loop {
        match events.recv().await {
            Ok(UiEvent::TimerIncrement {
                time_to_add,
                reason,
            }) => info!(time_to_add, %reason, "timer-increment"),
            Ok(event) => debug!(?event, "ui event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "ui event log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(overlay_ws_handler))
        .route("/ui", get(ui_ws_handler))
        .route("/healthz", get(healthz))
        .route("/timer", get(get_timer))
        .route("/timer/set", post(set_timer))
        .route("/timer/add", post(add_timer))
        .route("/timer/start", post(start_timer))
        .route("/timer/pause", post(pause_timer))
        .route("/timer/reset", post(reset_timer))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/theme", get(get_theme).put(put_theme))
        .route("/status", get(status))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn unavailable(error: ControllerClosed) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiError::new(ErrorCode::Unavailable, error.to_string())),
    )
}

async fn control(state: &AppState, command: TimerCommand) -> ApiResult<TimerState> {
    state
        .timer
        .apply(command)
        .await
        .map(Json)
        .map_err(unavailable)
}

async fn get_timer(State(state): State<Arc<AppState>>) -> ApiResult<TimerState> {
    state.timer.snapshot().await.map(Json).map_err(unavailable)
}

async fn set_timer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetTimeRequest>,
) -> ApiResult<TimerState> {
    control(&state, TimerCommand::Set(req.seconds)).await
}

async fn add_timer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddTimeRequest>,
) -> ApiResult<TimerState> {
    if !req.seconds.is_finite() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "seconds must be finite")),
        ));
    }
    control(&state, TimerCommand::Add(req.seconds)).await
}

async fn start_timer(State(state): State<Arc<AppState>>) -> ApiResult<TimerState> {
    control(&state, TimerCommand::Start).await
}

async fn pause_timer(State(state): State<Arc<AppState>>) -> ApiResult<TimerState> {
    control(&state, TimerCommand::Pause).await
}

async fn reset_timer(State(state): State<Arc<AppState>>) -> ApiResult<TimerState> {
    control(&state, TimerCommand::Reset).await
}

async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<IncrementSettings> {
    state.timer.increments().await.map(Json).map_err(unavailable)
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<IncrementSettings> {
    match state.timer.update_settings(update).await {
        Ok(Ok(increments)) => Ok(Json(increments)),
        Ok(Err(error)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiError::new(ErrorCode::Validation, error.to_string())),
        )),
        Err(error) => Err(unavailable(error)),
    }
}

async fn get_theme(State(state): State<Arc<AppState>>) -> Json<ThemeSettings> {
    Json(state.hub.theme().await)
}

async fn put_theme(
    State(state): State<Arc<AppState>>,
    Json(theme): Json<ThemeSettings>,
) -> Json<ThemeSettings> {
    Json(state.hub.update_theme(theme).await)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let feed = *state.feed_status.borrow();
    Json(StatusResponse {
        feed,
        overlay_clients: state.hub.client_count().await,
    })
}

async fn overlay_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| overlay_connection(state, socket))
}

async fn overlay_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut frames) = state.hub.register().await;

    let send_task = tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => state.hub.handle_request(client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.remove(client_id).await;
    send_task.abort();
}

async fn ui_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let events = state.ui.subscribe();
    ws.on_upgrade(move |socket| ui_connection(socket, events))
}

async fn ui_connection(socket: WebSocket, events: broadcast::Receiver<UiEvent>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(events);

    let send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "ui client fell behind");
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#![forbid(unsafe_code)]

//! TubeVault daemon: wires the download service to an HTTP/WebSocket API.
//!
//! The API surface is deliberately thin. Submissions, job listings and
//! settings are plain JSON endpoints; live progress flows over `/ws`, where
//! each connection is registered as a hub subscriber for as long as the
//! socket stays healthy.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Path as AxumPath, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use tubevault::config::{ConfigOverrides, RuntimeConfig, resolve_config};
use tubevault::domain::{Event, Job, Settings};
use tubevault::hub::{EventHub, Subscriber};
use tubevault::repository::{JobRepository, SettingsRepository, SqliteStore};
use tubevault::service::{Service, ServiceConfig};

/// Keep-alive ping cadence; just under common 60 s proxy idle timeouts.
const WS_PING_INTERVAL: Duration = Duration::from_secs(54);
/// Outgoing event buffer per connection. A client that falls this far
/// behind is dropped rather than queued further.
const WS_SEND_BUFFER: usize = 32;

#[derive(Debug, Clone, Default)]
struct DaemonArgs {
    download_root: Option<PathBuf>,
    database_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    ytdlp_bin: Option<PathBuf>,
    env_path: Option<PathBuf>,
}

impl DaemonArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-root=") {
                parsed.download_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--db=") {
                parsed.database_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp=") {
                parsed.ytdlp_bin = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                parsed.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--download-root" => {
                    parsed.download_root = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                "--db" => {
                    parsed.database_path = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                "--host" => {
                    parsed.host = Some(next_value(&mut args, &arg)?);
                }
                "--port" => {
                    parsed.port = Some(parse_port(&next_value(&mut args, &arg)?)?);
                }
                "--ytdlp" => {
                    parsed.ytdlp_bin = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                "--env" => {
                    parsed.env_path = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                _ => anyhow::bail!(
                    "unknown argument: {arg}\nUsage: vaultd [--download-root <path>] [--db <path>] [--host <addr>] [--port <port>] [--ytdlp <bin>] [--env <file>]"
                ),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            download_root: self.download_root,
            database_path: self.database_path,
            host: self.host,
            port: self.port,
            ytdlp_bin: self.ytdlp_bin,
            env_path: self.env_path,
            ..ConfigOverrides::default()
        }
    }
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{flag} requires a value"))
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.parse::<u16>()
        .with_context(|| format!("invalid port: {raw}"))
}

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    repo: Arc<dyn JobRepository>,
    settings: Arc<dyn SettingsRepository>,
    hub: Arc<EventHub>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Everything vaultd writes (archives, the job database, info files)
    // carries the invoking user's ownership; a root launch would leave
    // root-owned files behind that later unprivileged runs cannot touch.
    if nix::unistd::Uid::current().is_root() {
        anyhow::bail!("vaultd refuses to run as root: the download root and job database would end up root-owned");
    }

    let args = DaemonArgs::parse()?;
    let config = resolve_config(args.into_overrides())?;
    std::fs::create_dir_all(&config.download_root)
        .with_context(|| format!("creating download root {}", config.download_root.display()))?;

    let store = Arc::new(SqliteStore::open(&config.database_path).await?);
    let hub = EventHub::new();
    let service = Service::new(
        ServiceConfig {
            download_root: config.download_root.clone(),
            ytdlp_bin: config.ytdlp_bin.clone(),
            concurrency: config.concurrency,
            max_quality: config.max_quality,
        },
        Arc::clone(&store) as Arc<dyn JobRepository>,
        Arc::clone(&store) as Arc<dyn SettingsRepository>,
        hub,
    );
    service.start();

    let state = AppState {
        hub: service.hub(),
        repo: Arc::clone(&store) as Arc<dyn JobRepository>,
        settings: Arc::clone(&store) as Arc<dyn SettingsRepository>,
        service: Arc::clone(&service),
    };

    let app = Router::new()
        .route("/api/download", post(submit_download))
        .route("/api/jobs/recent", get(recent_jobs))
        .route("/api/jobs/{id}", get(job_by_id))
        .route("/api/jobs/{id}/videos", get(videos_for_parent))
        .route("/api/jobs/{id}/parents", get(parents_for_video))
        .route("/api/downloads", get(downloads_by_type))
        .route("/api/stats", get(stats))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let addr = bind_addr(&config)?;
    tracing::info!(%addr, root = %config.download_root.display(), "vaultd listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    service.stop().await;
    Ok(())
}

fn bind_addr(config: &RuntimeConfig) -> Result<SocketAddr> {
    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen host: {}", config.host))?;
    Ok(SocketAddr::new(host, config.port))
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    #[serde(default)]
    custom_quality: Option<i64>,
}

async fn submit_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    if request.url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "url must not be empty"})),
        )
            .into_response();
    }

    let mut job = Job::new(uuid::Uuid::new_v4().to_string(), request.url.trim());
    job.custom_quality = request.custom_quality;
    let job_id = job.id.clone();

    match state.service.submit(job).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"jobID": job_id, "message": "added to download queue"})),
        )
            .into_response(),
        Err(err) if err.to_string().contains("duplicate") => (
            StatusCode::CONFLICT,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(err) if err.to_string().contains("queue is full") => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn recent_jobs(State(state): State<AppState>, Query(query): Query<RecentQuery>) -> Response {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match state.repo.get_recent_with_metadata(limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn job_by_id(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.repo.get_job_with_metadata(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "job not found"})),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn videos_for_parent(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.repo.get_videos_for_parent(&id).await {
        Ok(videos) => Json(videos).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn parents_for_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.repo.get_parents_for_video(&id).await {
        Ok(parents) => Json(parents).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadsQuery {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    order: Option<String>,
}

async fn downloads_by_type(
    State(state): State<AppState>,
    Query(query): Query<DownloadsQuery>,
) -> Response {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    let result = state
        .repo
        .get_metadata_by_type(
            &query.content_type,
            page,
            limit,
            query.sort_by.as_deref().unwrap_or("created_at"),
            query.order.as_deref().unwrap_or("desc"),
        )
        .await;

    match result {
        Ok((items, total)) => Json(json!({
            "items": items,
            "totalCount": total,
            "page": page.max(1),
        }))
        .into_response(),
        Err(err) if err.to_string().contains("invalid content type") => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    let videos = state.repo.count_videos().await;
    let playlists = state.repo.count_playlists().await;
    let channels = state.repo.count_channels().await;
    match (videos, playlists, channels) {
        (Ok(videos), Ok(playlists), Ok(channels)) => Json(json!({
            "videos": videos,
            "playlists": playlists,
            "channels": channels,
        }))
        .into_response(),
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => internal_error(err),
    }
}

async fn get_settings(State(state): State<AppState>) -> Response {
    match state.settings.get().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    theme: Option<String>,
    download_quality: Option<i64>,
    concurrent_downloads: Option<i64>,
}

async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<SettingsRequest>,
) -> Response {
    let current = match state.settings.get().await {
        Ok(settings) => settings,
        Err(err) => return internal_error(err),
    };
    let updated = Settings {
        id: current.id,
        theme: request.theme.unwrap_or(current.theme),
        download_quality: request.download_quality.unwrap_or(current.download_quality),
        concurrent_downloads: request
            .concurrent_downloads
            .unwrap_or(current.concurrent_downloads),
        created_at: current.created_at,
        updated_at: current.updated_at,
    };
    match state.settings.update(&updated).await {
        Ok(()) => Json(updated).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Hub subscriber backed by a bounded channel. The socket task drains it;
/// a client that stops reading fills the buffer and gets dropped by the hub.
struct WsSubscriber {
    outgoing: mpsc::Sender<String>,
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn deliver(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).context("serializing event")?;
        self.outgoing
            .try_send(payload)
            .map_err(|_| anyhow!("subscriber buffer full or closed"))
    }
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<EventHub>) {
    let (outgoing, mut events) = mpsc::channel::<String>(WS_SEND_BUFFER);
    let id = hub.register(Arc::new(WsSubscriber { outgoing })).await;

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
            event = events.recv() => match event {
                Some(payload) => {
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.unregister(id).await;
}

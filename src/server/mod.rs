//! HTTP/WebSocket glue over the download engine. No logic of its own
//! beyond request parsing and reconnection dispatch.

use crate::engine::catalog;
use crate::engine::registry::SessionEntry;
use crate::engine::{
    CancelOutcome, ClientMessage, ContentKind, DownloadEngine, RequestParams,
};
use crate::history::HistoryRecord;
use crate::media::platform::Platform;
use anyhow::Result;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

pub fn router(engine: DownloadEngine) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/video-info", post(video_info))
        .route("/ws/download/{id}", get(ws_download))
        .route("/api/cancel/{id}", post(cancel_download))
        .route("/downloads/{filename}", get(serve_download))
        .route("/api/history", get(history_list).delete(history_clear))
        .route("/api/history/{id}", delete(history_delete))
        .with_state(engine)
}

pub async fn run(engine: DownloadEngine) -> Result<()> {
    let addr = engine.config.listen_addr.clone();
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "status": "running",
        "message": "Media download session engine",
        "supported_platforms": [
            "YouTube", "TikTok", "Twitter/X", "Instagram",
            "Facebook", "Reddit", "Vimeo", "Dailymotion"
        ],
    }))
}

#[derive(Debug, Deserialize)]
struct VideoInfoRequest {
    url: String,
}

async fn video_info(
    State(engine): State<DownloadEngine>,
    Json(req): Json<VideoInfoRequest>,
) -> Response {
    let platform = Platform::detect(&req.url);
    debug!("Resolving {} ({})", req.url, platform.label());

    let info = match engine.media.extract(&req.url, &platform.quirks()).await {
        Ok(info) => info,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Failed to get video info: {}", e) })),
            )
                .into_response();
        }
    };

    let catalog = catalog::normalize(&info.formats);

    let mut video_formats: Vec<&catalog::StreamDescriptor> = catalog
        .iter()
        .filter(|d| d.has_video() && d.height.is_some())
        .collect();
    video_formats.sort_by(|a, b| b.height.cmp(&a.height));
    let mut seen = HashSet::new();
    let video_formats: Vec<Value> = video_formats
        .into_iter()
        .filter(|d| seen.insert((d.height, d.container.clone())))
        .map(|d| {
            json!({
                "resolution": format!("{}p", d.height.unwrap_or(0)),
                "format_id": d.id,
                "ext": d.container,
                "vcodec": d.video_codec,
                "filesize": d.size_bytes,
                "height": d.height,
            })
        })
        .collect();

    let audio_formats: Vec<Value> = catalog
        .iter()
        .filter(|d| d.has_audio() && !d.has_video())
        .map(|d| {
            json!({
                "format": d.container,
                "format_id": d.id,
                "acodec": d.audio_codec,
                "filesize": d.size_bytes,
                "tbr": d.bitrate,
            })
        })
        .collect();

    Json(json!({
        "title": info.metadata.title,
        "url": info.metadata.webpage_url.unwrap_or(req.url),
        "thumbnail": info.metadata.thumbnail,
        "duration": info.metadata.duration,
        "uploader": info.metadata.uploader,
        "video_formats": video_formats,
        "audio_formats": audio_formats,
        "platform": platform.label(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    url: String,
    #[serde(rename = "type", default)]
    kind: Option<ContentKind>,
    quality: Option<String>,
    format: Option<String>,
}

async fn ws_download(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(engine): State<DownloadEngine>,
) -> Response {
    ws.on_upgrade(move |socket| handle_download_socket(socket, id, engine))
}

async fn handle_download_socket(mut socket: WebSocket, id: String, engine: DownloadEngine) {
    let (tx, rx) = mpsc::unbounded_channel();

    // A live session under this id means the client is reconnecting: swap
    // in this connection as the observer and replay a snapshot. The worker
    // is never restarted. Unknown or terminal ids start a fresh job.
    if let Some(existing) = engine.registry.get(&id) {
        if !existing.status().is_terminal() {
            let generation = existing.attach(tx);
            let snapshot = existing.snapshot();
            info!("Client reconnected to session {}", id);
            let frame = ClientMessage::Reconnected {
                percent: snapshot.progress_percent,
                message: "Reconnected to active download".to_string(),
                total: snapshot.total,
                speed: snapshot.speed,
                eta: snapshot.eta,
            };
            if send_frame(&mut socket, &frame).await.is_err() {
                existing.detach(generation);
                return;
            }
            pump(socket, existing, generation, rx).await;
            return;
        }
    }

    let Some(request) = read_start_request(&mut socket, &engine).await else {
        return;
    };
    info!("Session {} started for {}", id, request.url);
    let entry = engine.registry.create(&id, request);
    let generation = entry.attach(tx);
    if !engine.spawn_worker(entry.clone()) {
        // Lost a race against another connection that already started this
        // session; behave like a reconnect to its live worker.
        let snapshot = entry.snapshot();
        let frame = ClientMessage::Reconnected {
            percent: snapshot.progress_percent,
            message: "Reconnected to active download".to_string(),
            total: snapshot.total,
            speed: snapshot.speed,
            eta: snapshot.eta,
        };
        if send_frame(&mut socket, &frame).await.is_err() {
            entry.detach(generation);
            return;
        }
    }
    pump(socket, entry, generation, rx).await;
}

/// Wait for the client's start message and resolve its defaults.
async fn read_start_request(
    socket: &mut WebSocket,
    engine: &DownloadEngine,
) -> Option<RequestParams> {
    let text = loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => break text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!("Client transport dropped before start message: {}", e);
                return None;
            }
        }
    };

    let parsed: StartRequest = match serde_json::from_str(text.as_str()) {
        Ok(parsed) => parsed,
        Err(e) => {
            let frame = ClientMessage::Error {
                message: format!("Invalid start message: {}", e),
            };
            let _ = send_frame(socket, &frame).await;
            return None;
        }
    };
    if parsed.url.is_empty() {
        let frame = ClientMessage::Error {
            message: "Missing url".to_string(),
        };
        let _ = send_frame(socket, &frame).await;
        return None;
    }

    Some(RequestParams {
        url: parsed.url,
        kind: parsed.kind.unwrap_or_default(),
        quality: parsed
            .quality
            .unwrap_or_else(|| engine.config.default_quality.clone()),
        format: parsed
            .format
            .unwrap_or_else(|| engine.config.default_audio_format.clone()),
    })
}

/// Forward engine frames to the socket until the session reaches a
/// terminal frame or the client goes away. A disconnect only detaches the
/// observer; the worker keeps running.
async fn pump(
    mut socket: WebSocket,
    entry: Arc<SessionEntry>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let terminal = frame.is_terminal();
                if send_frame(&mut socket, &frame).await.is_err() {
                    entry.detach(generation);
                    debug!("Client transport dropped for session {}", entry.id());
                    return;
                }
                if terminal {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        entry.detach(generation);
                        debug!("Client disconnected from session {}", entry.id());
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        entry.detach(generation);
                        debug!("Client transport error for session {}: {}", entry.id(), e);
                        return;
                    }
                }
            }
        }
    }

    entry.detach(generation);
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &ClientMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}

async fn cancel_download(
    Path(id): Path<String>,
    State(engine): State<DownloadEngine>,
) -> Json<Value> {
    match engine.registry.cancel(&id) {
        CancelOutcome::Cancelled => Json(json!({
            "status": "cancelled",
            "message": "Download cancellation requested",
        })),
        CancelOutcome::AlreadyFinished(status) => Json(json!({
            "status": status.as_str(),
            "message": "Download already finished",
        })),
        CancelOutcome::NotFound => Json(json!({
            "status": "not_found",
            "message": "Download not found",
        })),
    }
}

fn media_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("");
    match ext {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" => "audio/opus",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains("..")
        && !filename.contains('/')
        && !filename.contains('\\')
}

/// Serve a finished file once, deleting it shortly afterwards so the
/// downloads directory does not grow without bound. The body is streamed;
/// merged videos are far too large to buffer.
async fn serve_download(
    Path(filename): Path<String>,
    State(engine): State<DownloadEngine>,
) -> Response {
    if !is_safe_filename(&filename) {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }

    let path = engine.config.downloads_dir.join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };
    let size = file.metadata().await.ok().map(|m| m.len());

    let delay = engine.config.serve_cleanup_delay_secs;
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
        if tokio::fs::remove_file(&path).await.is_ok() {
            info!("Cleaned up served file {}", path.display());
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(media_type_for(&filename)),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    let body = Body::from_stream(ReaderStream::new(file));
    (headers, body).into_response()
}

async fn history_list(State(engine): State<DownloadEngine>) -> Json<Vec<HistoryRecord>> {
    Json(engine.history.list())
}

async fn history_delete(
    Path(id): Path<Uuid>,
    State(engine): State<DownloadEngine>,
) -> Response {
    if engine.history.delete(id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "History record not found").into_response()
    }
}

async fn history_clear(State(engine): State<DownloadEngine>) -> StatusCode {
    engine.history.clear();
    StatusCode::NO_CONTENT
}

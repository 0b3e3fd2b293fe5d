use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap},
    response::{Html, IntoResponse},
    routing::get,
    Json,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

use crate::{
    bsl::canonical_mime,
    events::RoomSummary,
    playlist::TrackSet,
    probe,
    server::{
        csrf::{session_cookie, session_from_headers},
        errors::{ApiError, ApiResult},
        AppState, Router,
    },
    validate::is_valid_filename,
};

/// How long a media directory listing stays cached.
const FILES_CACHE_TTL: Duration = Duration::from_secs(20);

/// Per-minute request caps per endpoint.
const FILES_CAP: u32 = 35;
const TRACKS_CAP: u32 = 60;
const THUMBNAIL_CAP: u32 = 50;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TracksResponse {
    pub tracks: TrackSet,
    pub uses_hevc: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailResponse {
    /// URL of the generated image, or null when none could be produced
    pub thumbnail: Option<String>,
    pub is_audio: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerModeResponse {
    pub server_mode: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpnCheckResponse {
    pub vpn: bool,
}

/// A 20-second cache over the media directory listing.
#[derive(Debug, Default)]
pub struct FileCache {
    inner: Mutex<Option<(Instant, Vec<MediaFile>)>>,
}

impl FileCache {
    pub async fn list(&self, media_dir: PathBuf) -> Vec<MediaFile> {
        if let Some((fetched, files)) = self.inner.lock().as_ref() {
            if fetched.elapsed() < FILES_CACHE_TTL {
                return files.clone();
            }
        }

        let files = spawn_blocking(move || scan_media_dir(&media_dir))
            .await
            .unwrap_or_default();

        *self.inner.lock() = Some((Instant::now(), files.clone()));
        files
    }
}

/// Lists media files, filtered by the extension allow-list and the
/// filename validator.
fn scan_media_dir(media_dir: &std::path::Path) -> Vec<MediaFile> {
    let Ok(entries) = fs::read_dir(media_dir) else {
        return Vec::new();
    };

    let mut files: Vec<_> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let extension = name.rsplit_once('.')?.1.to_ascii_lowercase();

            if !is_valid_filename(&name) || canonical_mime(&extension).is_none() {
                return None;
            }

            let size = entry.metadata().ok()?.len();
            Some(MediaFile { name, size })
        })
        .collect();

    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

fn guard(
    state: &AppState,
    addr: SocketAddr,
    endpoint: &'static str,
    cap: u32,
) -> ApiResult<()> {
    if state.http_limiter.check(addr.ip(), endpoint, cap) {
        Ok(())
    } else {
        Err(ApiError::RateLimited)
    }
}

#[utoipa::path(
    get,
    path = "/api/rooms",
    tag = "rooms",
    responses(
        (status = 200, body = Vec<RoomSummary>)
    )
)]
async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.context.rooms.list_public())
}

#[utoipa::path(
    get,
    path = "/api/rooms/{code}",
    tag = "rooms",
    responses(
        (status = 200, body = RoomSummary),
        (status = 404, description = "No such room")
    )
)]
async fn room_summary(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<RoomSummary>> {
    let room = state
        .context
        .rooms
        .room(&code)
        .map_err(|_| ApiError::NotFound { resource: "room" })?;

    Ok(Json(room.summary()))
}

#[utoipa::path(
    get,
    path = "/api/files",
    tag = "media",
    responses(
        (status = 200, body = Vec<MediaFile>)
    )
)]
async fn list_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResult<Json<Vec<MediaFile>>> {
    guard(&state, addr, "files", FILES_CAP)?;

    let files = state
        .files
        .list(state.context.config.media_dir.clone())
        .await;

    Ok(Json(files))
}

#[utoipa::path(
    get,
    path = "/api/tracks/{filename}",
    tag = "media",
    responses(
        (status = 200, body = TracksResponse),
        (status = 400, description = "Invalid filename")
    )
)]
async fn tracks(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
) -> ApiResult<Json<TracksResponse>> {
    guard(&state, addr, "tracks", TRACKS_CAP)?;

    if !is_valid_filename(&filename) {
        return Err(ApiError::Invalid("filename"));
    }

    let path = state.context.config.media_dir.join(&filename);
    let probed = probe::probe_media(&path).await;

    Ok(Json(TracksResponse {
        tracks: probed.tracks,
        uses_hevc: probed.uses_hevc,
    }))
}

#[utoipa::path(
    get,
    path = "/api/thumbnail/{filename}",
    tag = "media",
    responses(
        (status = 200, body = ThumbnailResponse),
        (status = 400, description = "Invalid filename")
    )
)]
async fn thumbnail(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
) -> ApiResult<Json<ThumbnailResponse>> {
    guard(&state, addr, "thumbnail", THUMBNAIL_CAP)?;

    if !is_valid_filename(&filename) {
        return Err(ApiError::Invalid("filename"));
    }

    let media_path = state.context.config.media_dir.join(&filename);
    let cache_dir = state.context.store.thumbnail_dir();

    let thumbnail = probe::generate_thumbnail(&media_path, &cache_dir, &filename)
        .await
        .map_err(|err| ApiError::Unknown(err.to_string()))?;

    Ok(Json(ThumbnailResponse {
        thumbnail: thumbnail
            .file
            .map(|_| format!("/thumbnails/{}.jpg", filename)),
        is_audio: thumbnail.is_audio,
    }))
}

#[utoipa::path(
    get,
    path = "/api/csrf-token",
    tag = "session",
    responses(
        (status = 200, body = CsrfTokenResponse)
    )
)]
async fn csrf_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session = session_from_headers(&headers);
    let (session, token) = state.csrf.issue(session.as_deref());

    (
        [(header::SET_COOKIE, session_cookie(&session))],
        Json(CsrfTokenResponse { csrf_token: token }),
    )
}

#[utoipa::path(
    get,
    path = "/api/server-mode",
    tag = "session",
    responses(
        (status = 200, body = ServerModeResponse)
    )
)]
async fn server_mode(State(state): State<AppState>) -> Json<ServerModeResponse> {
    Json(ServerModeResponse {
        server_mode: state.context.config.server_mode,
    })
}

#[utoipa::path(
    get,
    path = "/api/vpn-check",
    tag = "session",
    responses(
        (status = 200, body = VpnCheckResponse)
    )
)]
async fn vpn_check() -> Json<VpnCheckResponse> {
    Json(VpnCheckResponse {
        vpn: std::env::var("SYNC_VPN").is_ok(),
    })
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    let page = if state.context.config.server_mode {
        "landing.html"
    } else {
        "viewer.html"
    };

    Html(render_page(&state, page, None))
}

async fn admin_page(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    admin_page_inner(state, headers, None)
}

async fn admin_page_for_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> impl IntoResponse {
    admin_page_inner(state, headers, Some(code))
}

/// The admin page always gets a fresh CSRF token bound to the session
/// cookie, and optionally a server-rendered initial state.
fn admin_page_inner(
    state: AppState,
    headers: HeaderMap,
    code: Option<String>,
) -> impl IntoResponse {
    let session = session_from_headers(&headers);
    let (session, token) = state.csrf.issue(session.as_deref());

    let hydrated = state.context.config.data_hydration.then(|| {
        json!({
            "serverMode": state.context.config.server_mode,
            "csrfToken": token,
            "room": code
                .as_deref()
                .and_then(|code| state.context.rooms.room(code).ok())
                .map(|room| room.summary()),
            "rooms": state.context.rooms.list_public(),
        })
    });

    (
        [(header::SET_COOKIE, session_cookie(&session))],
        Html(render_page(&state, "admin.html", hydrated)),
    )
}

async fn watch_page(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Html<String>> {
    state
        .context
        .rooms
        .room(&code)
        .map_err(|_| ApiError::NotFound { resource: "room" })?;

    Ok(Html(render_page(&state, "viewer.html", None)))
}

/// Loads a page from the web directory, inlining hydrated state at the
/// `<!--SYNC_STATE-->` marker when enabled.
fn render_page(state: &AppState, name: &str, hydrated: Option<serde_json::Value>) -> String {
    let path = state.context.config.web_dir.join(name);
    let template = fs::read_to_string(&path).unwrap_or_else(|_| fallback_page(name));

    match hydrated {
        Some(value) => template.replace(
            "<!--SYNC_STATE-->",
            &format!("<script>window.__SYNC_STATE__ = {};</script>", value),
        ),
        None => template,
    }
}

fn fallback_page(name: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>sync-player</title></head>\
         <body><p>Page {} is not installed.</p><!--SYNC_STATE--></body></html>",
        name
    )
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/admin", get(admin_page))
        .route("/admin/:code", get(admin_page_for_room))
        .route("/watch/:code", get(watch_page))
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:code", get(room_summary))
        .route("/api/files", get(list_files))
        .route("/api/tracks/:filename", get(tracks))
        .route("/api/thumbnail/:filename", get(thumbnail))
        .route("/api/csrf-token", get(csrf_token))
        .route("/api/server-mode", get(server_mode))
        .route("/api/vpn-check", get(vpn_check))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_scan_filters_by_extension_and_name() {
        let dir = tempfile::tempdir().unwrap();

        fs::write(dir.path().join("movie.mkv"), b"x").unwrap();
        fs::write(dir.path().join("song.mp3"), b"xy").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("bad;name.mkv"), b"x").unwrap();

        let files = scan_media_dir(dir.path());
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();

        assert_eq!(names, vec!["movie.mkv", "song.mp3"]);
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn missing_media_dir_lists_nothing() {
        let files = scan_media_dir(std::path::Path::new("/definitely/not/here"));
        assert!(files.is_empty());
    }
}

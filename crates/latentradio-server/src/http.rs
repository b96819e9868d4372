//! The HTTP surface. Thin by design: every handler
//! resolves a session through the [`Registry`](crate::registry::Registry)
//! then calls exactly one [`Session`](crate::session::Session) operation.
//!
//! Streamed response bodies (`/stream`, `/events`) are kept alive by a guard
//! value whose `Drop` detaches the client — the session's own
//! `AudioAttachment`/`EventAttachment`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use latentradio_proto::config::Config;
use latentradio_proto::direction::Direction;
use latentradio_proto::errors::ErrorKind;
use latentradio_proto::session_types::{Fingerprint, RefreshStage, SelectionOrigin, SessionId};
use latentradio_proto::track::{Track, TrackSummary};

use crate::catalog::Catalog;
use crate::explorer::ExplorerFilters;
use crate::logs::RecentLogs;
use crate::registry::{Registry, ResolveParams};
use crate::session::{AudioAttachment, EventAttachment, RefreshStageResult, Session};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub catalog: Option<Arc<Catalog>>,
    pub config: Config,
    pub recent_logs: Arc<RecentLogs>,
    pub started_at: std::time::Instant,
}

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream_audio))
        .route("/events", get(stream_events))
        .route("/explorer", post(post_explorer))
        .route("/next-track", post(post_next_track))
        .route("/refresh-sse", post(post_refresh_sse))
        .route("/session/force-next", post(post_force_next))
        .route("/session/reset-drift", post(post_reset_drift))
        .route("/session/zoom/:mode", post(post_zoom))
        .route("/search", get(get_search))
        .route("/sessions/now-playing", get(get_now_playing))
        .route("/health", get(get_health))
        .route("/internal/metrics", get(get_metrics))
        .route("/internal/sessions", get(get_internal_sessions))
        .route("/internal/logs/recent", get(get_recent_logs))
        .route("/:seg1", get(get_deep_link_one))
        .route("/:seg1/:seg2", get(get_deep_link_two))
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

struct ApiError(ErrorKind);

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self(kind)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Session resolution helpers ───────────────────────────────────────────

const COOKIE_NAME: &str = "lr_sid";

fn cookie_session_id(headers: &HeaderMap) -> Option<SessionId> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let pair = pair.trim();
        pair.strip_prefix(COOKIE_NAME)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|value| SessionId(value.to_string()))
    })
}

fn set_session_cookie(id: &SessionId) -> (axum::http::HeaderName, String) {
    (axum::http::header::SET_COOKIE, format!("{}={}; Path=/; HttpOnly", COOKIE_NAME, id.0))
}

async fn resolve(
    state: &AppState,
    explicit_id: Option<String>,
    fingerprint: Option<String>,
    cookie_id: Option<SessionId>,
    client_ip: Option<std::net::IpAddr>,
) -> ApiResult<Session> {
    let params = ResolveParams {
        explicit_id: explicit_id.map(SessionId),
        fingerprint: fingerprint.map(Fingerprint),
        cookie_id,
        client_ip,
    };
    Ok(state.registry.resolve(params, false).await?)
}

// ── GET / ─────────────────────────────────────────────────────────────────

async fn index(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session = resolve(&state, None, None, cookie_session_id(&headers), Some(addr.ip())).await?;
    let (name, value) = set_session_cookie(&session.id);
    let mut response = "latentradio server: exploratory music session active\n".into_response();
    response.headers_mut().insert(name, value.parse().unwrap());
    Ok(response)
}

// ── GET/HEAD /stream ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    fingerprint: Option<String>,
}

fn pcm_stream(attachment: AudioAttachment) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    stream::unfold(attachment, |mut attachment| async move {
        loop {
            match attachment.pcm_rx.recv().await {
                Ok(bytes) => return Some((Ok(bytes), attachment)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn stream_audio(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session = resolve(
        &state,
        params.session_id,
        params.fingerprint,
        cookie_session_id(&headers),
        Some(addr.ip()),
    )
    .await?;

    let attachment = session.attach_audio_client().await;
    let cfg = &state.config.mixer;
    let body = Body::from_stream(pcm_stream(attachment));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .header("x-sample-rate", cfg.sample_rate.to_string())
        .header("x-channels", cfg.channels.to_string())
        .header("x-sample-format", "f32le")
        .body(body)
        .unwrap())
}

// ── GET /events ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventsParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    fingerprint: Option<String>,
}

fn event_stream(attachment: EventAttachment) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let replay = attachment.replay.clone();
    stream::unfold((attachment, replay), |(mut attachment, mut pending_replay)| async move {
        if let Some(event) = pending_replay.take() {
            let frame = event.to_frame().unwrap_or_default();
            return Some((Ok(Bytes::from(frame)), (attachment, None)));
        }
        loop {
            match attachment.event_rx.recv().await {
                Ok(event) => {
                    let frame = event.to_frame().unwrap_or_default();
                    return Some((Ok(Bytes::from(frame)), (attachment, None)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session = resolve(
        &state,
        params.session_id,
        params.fingerprint,
        cookie_session_id(&headers),
        Some(addr.ip()),
    )
    .await?;

    let attachment = session.attach_event_client().await;
    let body = Body::from_stream(event_stream(attachment));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(body)
        .unwrap())
}

// ── POST /explorer ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExplorerBody {
    #[serde(rename = "trackId")]
    track_id: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "playlistTrackIds", default)]
    playlist_track_ids: Vec<String>,
    fingerprint: Option<String>,
}

async fn post_explorer(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ExplorerBody>,
) -> ApiResult<Response> {
    if !Track::is_valid_id(&body.track_id) {
        return Err(ErrorKind::InvalidArgument("trackId must be 32 lowercase hex chars".into()).into());
    }
    let session = resolve(
        &state,
        body.session_id,
        body.fingerprint,
        cookie_session_id(&headers),
        Some(addr.ip()),
    )
    .await?;

    let filters = ExplorerFilters {
        exclude_ids: body.playlist_track_ids.into_iter().collect(),
        ..Default::default()
    };
    let snapshot = session.request_snapshot(&body.track_id, filters).await?;
    Ok(Json(snapshot).into_response())
}

// ── POST /next-track ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NextTrackBody {
    #[serde(rename = "trackMd5")]
    track_md5: String,
    direction: Option<String>,
    origin: Option<String>,
    fingerprint: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct NextTrackResponse {
    status: &'static str,
    #[serde(rename = "trackId")]
    track_id: String,
    direction: Option<String>,
}

async fn post_next_track(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<NextTrackBody>,
) -> ApiResult<Response> {
    let session = resolve(
        &state,
        body.session_id,
        body.fingerprint,
        cookie_session_id(&headers),
        Some(addr.ip()),
    )
    .await?;

    if let Some(direction) = body.direction.as_deref() {
        if Direction::resolve_alias(direction).is_none() {
            return Err(ErrorKind::InvalidArgument("unrecognized direction key".into()).into());
        }
    }

    let origin = match body.origin.as_deref() {
        Some("deck") => SelectionOrigin::Deck,
        _ => SelectionOrigin::General,
    };
    let result = session.commit_next_selection(body.track_md5, body.direction, origin).await?;
    Ok(Json(NextTrackResponse {
        status: result.status,
        track_id: result.track_id,
        direction: result.direction,
    })
    .into_response())
}

// ── POST /refresh-sse ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RefreshBody {
    fingerprint: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    ok: bool,
    stage: RefreshStage,
    #[serde(rename = "currentTrack")]
    current_track: Option<TrackSummary>,
}

async fn post_refresh_sse(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Response> {
    let session = resolve(
        &state,
        body.session_id,
        body.fingerprint,
        cookie_session_id(&headers),
        Some(addr.ip()),
    )
    .await?;

    let result = session.refresh_sse().await?;
    let stage = match result.stage {
        RefreshStageResult::Restart => RefreshStage::Restart,
        RefreshStageResult::Rebroadcast => RefreshStage::Rebroadcast,
    };
    Ok(Json(RefreshResponse {
        ok: true,
        stage,
        current_track: result.current_track,
    })
    .into_response())
}

// ── POST /session/force-next, /session/reset-drift, /session/zoom/:mode ──

#[derive(Debug, Default, Deserialize)]
struct SessionActionBody {
    fingerprint: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn post_force_next(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<SessionActionBody>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = resolve(&state, body.session_id, body.fingerprint, cookie_session_id(&headers), Some(addr.ip())).await?;
    session.force_next().await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

async fn post_reset_drift(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<SessionActionBody>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = resolve(&state, body.session_id, body.fingerprint, cookie_session_id(&headers), Some(addr.ip())).await?;
    session.reset_override().await;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

async fn post_zoom(
    State(state): State<AppState>,
    Path(mode): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<SessionActionBody>>,
) -> ApiResult<Response> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = resolve(&state, body.session_id, body.fingerprint, cookie_session_id(&headers), Some(addr.ip())).await?;
    session.set_resolution(mode).await;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

// ── GET /search ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    20
}

async fn get_search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult<Response> {
    let Some(catalog) = state.catalog.clone() else {
        return Ok(Json(Vec::<TrackSummary>::new()).into_response());
    };
    let query = params.q;
    let limit = params.limit;
    let tracks = tokio::task::spawn_blocking(move || catalog.fuzzy_search(&query, limit))
        .await
        .map_err(|_| ErrorKind::SessionUnavailable)?
        .map_err(|_| ErrorKind::SessionUnavailable)?;
    let summaries: Vec<TrackSummary> = tracks.iter().map(Track::summary).collect();
    Ok(Json(summaries).into_response())
}

// ── Deep links: GET /{32-hex} and GET /{32-hex}/{32-hex} ─────────────────

#[derive(Debug, Serialize)]
struct DeepLinkResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
    fingerprint: String,
}

async fn get_deep_link_one(
    State(state): State<AppState>,
    Path(seg1): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResult<Response> {
    if !Track::is_valid_id(&seg1) {
        return Err(ErrorKind::InvalidArgument("not a track identifier".into()).into());
    }
    let session = state.registry.create_session(seg1, None, true, Some(addr.ip())).await?;
    let (name, value) = set_session_cookie(&session.id);
    let mut response = Json(DeepLinkResponse {
        session_id: session.id.to_string(),
        fingerprint: session.fingerprint.to_string(),
    })
    .into_response();
    response.headers_mut().insert(name, value.parse().unwrap());
    Ok(response)
}

async fn get_deep_link_two(
    State(state): State<AppState>,
    Path((seg1, seg2)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResult<Response> {
    if !Track::is_valid_id(&seg1) || !Track::is_valid_id(&seg2) {
        return Err(ErrorKind::InvalidArgument("not a track identifier pair".into()).into());
    }
    let session = state
        .registry
        .create_session(seg1, Some(seg2), true, Some(addr.ip()))
        .await?;
    let (name, value) = set_session_cookie(&session.id);
    let mut response = Json(DeepLinkResponse {
        session_id: session.id.to_string(),
        fingerprint: session.fingerprint.to_string(),
    })
    .into_response();
    response.headers_mut().insert(name, value.parse().unwrap());
    Ok(response)
}

// ── Introspection / ops endpoints ─────────────────────────────────────────

#[derive(Debug, Serialize)]
struct NowPlayingEntry {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "currentTrack")]
    current_track: Option<TrackSummary>,
    #[serde(rename = "nextTrack")]
    next_track: Option<TrackSummary>,
    #[serde(rename = "elapsedMs")]
    elapsed_ms: u64,
    #[serde(rename = "audioClients")]
    audio_clients: usize,
    #[serde(rename = "eventClients")]
    event_clients: usize,
}

async fn now_playing_entries(state: &AppState) -> Vec<NowPlayingEntry> {
    state
        .registry
        .list_sessions()
        .await
        .into_iter()
        .map(|(id, snap)| NowPlayingEntry {
            session_id: id.to_string(),
            current_track: snap.current_track,
            next_track: snap.next_track,
            elapsed_ms: snap.track_started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0),
            audio_clients: snap.audio_clients,
            event_clients: snap.event_clients,
        })
        .collect()
}

async fn get_now_playing(State(state): State<AppState>) -> Json<Vec<NowPlayingEntry>> {
    Json(now_playing_entries(&state).await)
}

async fn get_internal_sessions(State(state): State<AppState>) -> Json<Vec<NowPlayingEntry>> {
    Json(now_playing_entries(&state).await)
}

async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.registry.stats().await;
    Json(serde_json::json!({
        "sessionCount": stats.session_count,
        "audioClients": stats.audio_clients,
        "eventClients": stats.event_clients,
        "primedCount": stats.primed_count,
        "catalogSize": state.registry.feature_index().len(),
        "latentAvailable": state.registry.latent_available(),
    }))
}

async fn get_recent_logs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.recent_logs.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_parsing_extracts_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "other=1; lr_sid=deadbeef; foo=bar".parse().unwrap());
        let id = cookie_session_id(&headers).unwrap();
        assert_eq!(id.0, "deadbeef");
    }

    #[test]
    fn cookie_parsing_absent_returns_none() {
        let headers = HeaderMap::new();
        assert!(cookie_session_id(&headers).is_none());
    }

    #[test]
    fn cookie_parsing_ignores_similarly_prefixed_names() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "lr_sid_extra=nope; lr_sid=yes".parse().unwrap());
        let id = cookie_session_id(&headers).unwrap();
        assert_eq!(id.0, "yes");
    }
}

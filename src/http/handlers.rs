//! HTTP request handlers
//!
//! Playback handlers serve the live playlist and segment bytes; the publish
//! handler issues single-use tokens. All storage reads run on the blocking
//! pool and no handler holds a playlist lock across I/O.

use std::io;
use std::sync::Arc;
use std::sync::OnceLock;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::valid_stream_key;
use crate::state::AppState;

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, body).into_response()
    }
}

fn segment_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^segment_(\d+)\.m4s$").expect("static regex"))
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Version endpoint
pub async fn version_check() -> &'static str {
    concat!("rtmp-hls-server v", env!("CARGO_PKG_VERSION"))
}

/// Live stream snapshots for operators
/// GET /debug/streams
pub async fn active_streams(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "streams": state.registry.list() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub stream_key: String,
    pub expires_in: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub publish_url: String,
    pub stream_key: String,
    pub token: String,
    pub expires_at: String,
}

/// Issue a single-use publish token
/// POST /publish
pub async fn issue_publish_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, HttpError> {
    if !valid_stream_key(&request.stream_key) {
        return Err(HttpError::BadRequest(format!(
            "invalid stream key {:?}",
            request.stream_key
        )));
    }

    let token = state
        .tokens
        .issue(&request.stream_key, request.expires_in.unwrap_or(0), None);

    Ok(Json(PublishResponse {
        publish_url: format!(
            "rtmp://{}/{}/{}?token={}",
            state.config.rtmp_addr, state.config.rtmp_app, request.stream_key, token.token
        ),
        stream_key: request.stream_key,
        token: token.token,
        expires_at: token.expires_at.to_rfc3339(),
    }))
}

/// Live media playlist
/// GET /live/{stream_key}/index.m3u8
pub async fn media_playlist(
    State(state): State<Arc<AppState>>,
    Path(stream_key): Path<String>,
) -> Result<Response, HttpError> {
    let handle = state
        .segmenter(&stream_key)
        .ok_or_else(|| HttpError::NotFound(format!("no such stream: {stream_key}")))?;

    let text = {
        let playlist = handle.playlist().read();
        if playlist.is_empty() {
            return Err(HttpError::NotFound("no segments yet".to_string()));
        }
        playlist.render()
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        "Content-Type",
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    Ok((headers, text).into_response())
}

/// Initialization segment
/// GET /live/{stream_key}/init.mp4
pub async fn init_segment(
    State(state): State<Arc<AppState>>,
    Path(stream_key): Path<String>,
) -> Result<Response, HttpError> {
    let data = storage_read(&state, format!("{stream_key}/init.mp4")).await?;

    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static("video/mp4"));
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok((headers, data).into_response())
}

/// Media segment at the live edge
/// GET /live/{stream_key}/segment_{N}.m4s
pub async fn media_segment(
    State(state): State<Arc<AppState>>,
    Path((stream_key, segment)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let sequence: u64 = segment_name_re()
        .captures(&segment)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| HttpError::NotFound(format!("no such object: {segment}")))?;

    let handle = state
        .segmenter(&stream_key)
        .ok_or_else(|| HttpError::NotFound(format!("no such stream: {stream_key}")))?;

    // only segments inside the live window are served
    let path = {
        let playlist = handle.playlist().read();
        playlist
            .get(sequence)
            .map(|record| record.path.clone())
            .ok_or_else(|| {
                HttpError::NotFound(format!("segment {sequence} not in the live window"))
            })?
    };

    let data = storage_read(&state, path).await?;

    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static("video/mp4"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    Ok((headers, data).into_response())
}

/// Blocking storage read on the blocking pool; missing objects map to 404
async fn storage_read(state: &Arc<AppState>, path: String) -> Result<Bytes, HttpError> {
    let storage = state.storage.clone();
    let read_path = path.clone();
    let result = tokio::task::spawn_blocking(move || storage.get(&read_path))
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    result.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            HttpError::NotFound(format!("no such object: {path}"))
        } else {
            warn!(path, error = %e, "storage read failed");
            HttpError::Internal("storage read failed".to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use crate::segmenter::{PlaylistState, SegmentRecord, SegmenterHandle};
    use crate::state::test_state;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use chrono::Utc;
    use tower::util::ServiceExt;

    fn record(sequence: u64) -> SegmentRecord {
        SegmentRecord {
            sequence,
            duration: 2.0,
            path: format!("cam1/segment_{sequence}.m4s"),
            uri: format!("segment_{sequence}.m4s"),
            byte_size: 4,
            created_at: Utc::now(),
        }
    }

    /// State with a stream that has segments 8..=10 in its window
    fn state_with_window() -> Arc<AppState> {
        let state = test_state();
        let mut playlist = PlaylistState::new(3);
        playlist.has_init = true;
        for seq in 8..=10u64 {
            let _ = playlist.push(record(seq));
            playlist.next_sequence = seq + 1;
            state
                .storage
                .put(&format!("cam1/segment_{seq}.m4s"), b"m4s!")
                .unwrap();
        }
        state.storage.put("cam1/init.mp4", b"init").unwrap();
        state
            .segmenters
            .insert("cam1".to_string(), SegmenterHandle::for_tests(playlist));
        state
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_issues_token() {
        let state = test_state();
        let app = create_router(state.clone());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/publish")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"streamKey":"cam1","expiresIn":60}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        let token = body["token"].as_str().unwrap();
        assert!(token.len() >= 22);
        assert_eq!(body["streamKey"], "cam1");
        assert!(body["publishUrl"]
            .as_str()
            .unwrap()
            .contains(&format!("/live/cam1?token={token}")));

        // the issued token actually validates
        assert!(state.tokens.validate(token, "cam1", None).is_ok());
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_key() {
        let app = create_router(test_state());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/publish")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"streamKey":"a/b"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_playlist_unknown_stream_404() {
        let app = create_router(test_state());
        let request = Request::builder()
            .uri("/live/ghost/index.m3u8")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_playlist_served_with_headers() {
        let app = create_router(state_with_window());
        let request = Request::builder()
            .uri("/live/cam1/index.m3u8")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(
            response.headers().get("Cache-Control").unwrap(),
            "no-cache, no-store, must-revalidate"
        );

        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:8"));
        assert!(text.contains("segment_10.m4s"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_init_segment_served_and_cacheable() {
        let app = create_router(state_with_window());
        let request = Request::builder()
            .uri("/live/cam1/init.mp4")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "video/mp4");
        assert_eq!(
            response.headers().get("Cache-Control").unwrap(),
            "public, max-age=3600"
        );
        assert_eq!(&body_bytes(response).await[..], b"init");
    }

    #[tokio::test]
    async fn test_head_supported() {
        let app = create_router(state_with_window());
        let request = Request::builder()
            .method(Method::HEAD)
            .uri("/live/cam1/init.mp4")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        // GET routes answer HEAD; the body is stripped at the server layer
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "video/mp4");
    }

    #[tokio::test]
    async fn test_segment_in_window_served() {
        let app = create_router(state_with_window());
        let request = Request::builder()
            .uri("/live/cam1/segment_9.m4s")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"m4s!");
    }

    #[tokio::test]
    async fn test_evicted_segment_404() {
        let app = create_router(state_with_window());
        let request = Request::builder()
            .uri("/live/cam1/segment_3.m4s")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_segment_name_404() {
        let app = create_router(state_with_window());
        for uri in ["/live/cam1/segment_x.m4s", "/live/cam1/whatever.bin"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_debug_streams() {
        let app = create_router(test_state());
        let request = Request::builder()
            .uri("/debug/streams")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body["streams"].as_array().unwrap().is_empty());
    }
}

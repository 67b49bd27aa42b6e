//! Axum router configuration

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{
    active_streams, health_check, init_segment, issue_publish_token, media_playlist,
    media_segment, version_check,
};

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::RANGE, header::CONTENT_TYPE, header::ORIGIN])
        .max_age(Duration::from_secs(3600));

    Router::new()
        // Control
        .route("/publish", post(issue_publish_token))
        // Playback (GET routes also answer HEAD)
        .route("/live/{stream_key}/index.m3u8", get(media_playlist))
        .route("/live/{stream_key}/init.mp4", get(init_segment))
        .route("/live/{stream_key}/{segment}", get(media_segment))
        // Operational
        .route("/health", get(health_check))
        .route("/version", get(version_check))
        .route("/debug/streams", get(active_streams))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // State
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;

    #[test]
    fn test_create_router() {
        let _router = create_router(test_state());
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::util::ServiceExt;

        let app = create_router(test_state());
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/live/cam1/index.m3u8")
            .header(header::ORIGIN, "http://localhost:8080")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }
}

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use pyhost_process::TargetId;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::{api, lifecycle::Controller};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct AppState {
    pub controller: Controller,
    /// The management API is only mounted when this is set.
    pub api_token: Option<Arc<str>>,
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(home))
        .route("/status", get(status_check))
        .route("/healthz", get(healthz));

    if state.api_token.is_some() {
        app = app.nest("/api", api::router(state.clone()));
    }

    app.layer(middleware::from_fn(request_id)).with_state(state)
}

/// Tags every request with an id (client supplied or fresh) and a tracing span.
pub async fn request_id(req: Request<Body>, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "http",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut res = next.run(req).instrument(span.clone()).await;
    span.in_scope(|| tracing::debug!(status = res.status().as_u16(), "request finished"));

    if let Ok(v) = HeaderValue::from_str(&id) {
        res.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    res
}

async fn home() -> &'static str {
    "🤖 pyhost agent is alive"
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    script: Option<String>,
}

async fn status_check(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Response {
    let Some(script) = q.script.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Specify script").into_response();
    };

    let target_id = TargetId::from(script);
    if state.controller.is_running(&target_id).await {
        (StatusCode::OK, format!("✅ {target_id} is running.")).into_response()
    } else {
        (StatusCode::NOT_FOUND, format!("❌ {target_id} is stopped.")).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    active: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active: state.controller.active_count().await,
    })
}


#[cfg(all(test, unix))]
mod tests {
    use axum::body::to_bytes;
    use tower::ServiceExt;

    use super::test_support::*;
    use super::*;

    async fn body_text(res: Response) -> String {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn home_reports_alive_with_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState {
            controller: controller(dir.path()).await,
            api_token: None,
        });

        let res = app.oneshot(get_req("/")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key(REQUEST_ID_HEADER));
        assert!(body_text(res).await.contains("alive"));
    }

    #[tokio::test]
    async fn client_request_id_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState {
            controller: controller(dir.path()).await,
            api_token: None,
        });

        let req = Request::builder()
            .uri("/healthz")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "abc-123");

        let v: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["active"], 0);
    }

    #[tokio::test]
    async fn status_check_tracks_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path()).await;
        let app = router(AppState {
            controller: controller.clone(),
            api_token: None,
        });

        let res = app.clone().oneshot(get_req("/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(get_req("/status?script=app.py"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(body_text(res).await.contains("app.py is stopped"));

        let id = controller
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();
        controller.start(ALICE, &id).await.unwrap();

        let res = app
            .clone()
            .oneshot(get_req("/status?script=app.py"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(body_text(res).await.contains("app.py is running"));

        controller.stop(ALICE, &id).await.unwrap();
        let res = app.oneshot(get_req("/status?script=app.py")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_is_not_mounted_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState {
            controller: controller(dir.path()).await,
            api_token: None,
        });

        let res = app.oneshot(get_req("/api/targets")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

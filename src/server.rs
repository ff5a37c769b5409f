//! HTTP surface: `POST /predict`, a health check, and static front-end files.

use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeader;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::pipeline::Predictor;

/// Largest accepted `POST /predict` body. Base64 inflates images by a third,
/// so this admits encoded photos of roughly 48 MiB.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Body of `POST /predict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Input image as a base64 data URL.
    pub image: String,
}

/// Response of `POST /predict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictResponse {
    fn success(image: String) -> Self {
        Self {
            success: true,
            image: Some(image),
            error: None,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            image: None,
            error: Some(message),
        }
    }
}

#[derive(Clone)]
struct AppState {
    predictor: Arc<Predictor>,
}

/// Build the application router.
///
/// When `static_dir` is given, every path not handled by the API is served
/// from it, with caching disabled.
pub fn router(predictor: Arc<Predictor>, static_dir: Option<&Path>) -> Router {
    let state = AppState { predictor };

    let app = Router::new()
        .route(
            "/predict",
            post(predict).layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES)),
        )
        .route("/healthz", get(healthz))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => app.fallback_service(SetResponseHeader::overriding(
            ServeDir::new(dir),
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        )),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn predict(
    State(state): State<AppState>,
    payload: std::result::Result<Json<PredictRequest>, JsonRejection>,
) -> (StatusCode, Json<PredictResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("rejected prediction request body: {rejection}");
            return (
                StatusCode::BAD_REQUEST,
                Json(PredictResponse::failure(rejection.body_text())),
            );
        }
    };

    let predictor = state.predictor.clone();

    let result = task::spawn_blocking(move || predictor.predict_data_url(&request.image)).await;

    match result {
        Ok(Ok(image)) => (StatusCode::OK, Json(PredictResponse::success(image))),
        Ok(Err(err)) if err.is_request_error() => {
            warn!("rejected prediction request: {err}");
            (
                StatusCode::BAD_REQUEST,
                Json(PredictResponse::failure(err.to_string())),
            )
        }
        Ok(Err(err)) => {
            error!("prediction failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PredictResponse::failure("internal inference error".to_string())),
            )
        }
        Err(err) => {
            error!("prediction task panicked: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PredictResponse::failure("internal inference error".to_string())),
            )
        }
    }
}

//! Intake HTTP gateway. Accepts analysis submissions, validates them, and
//! hands them to the intake queue. The response is a 202: acceptance, not
//! completion.

use std::sync::Arc;
use std::time::Duration;

use analysis_pipeline::{messages::AnalysisRequest, ANALYSIS_QUEUE};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{queue::amqp::AmqpTransport, queue::QueueTransport, utils::config::get_config};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone)]
struct ServerState {
    transport: Arc<dyn QueueTransport>,
}

#[derive(Error, Debug)]
enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InternalError(message) => {
                error!(%message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

/// Submission body with both fields optional so that a missing field is a
/// 400 with a useful message rather than a deserialization rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn health() -> &'static str {
    "Dispatch API is running!"
}

async fn submit(
    State(state): State<ServerState>,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(repo_url), Some(user_id)) = (body.repo_url, body.user_id) else {
        return Err(ApiError::ValidationError(
            "Missing repoUrl or userId in request body.".to_string(),
        ));
    };
    if repo_url.trim().is_empty() || user_id.trim().is_empty() {
        return Err(ApiError::ValidationError(
            "Missing repoUrl or userId in request body.".to_string(),
        ));
    }

    let request = AnalysisRequest {
        repo_url: repo_url.clone(),
        user_id: user_id.clone(),
    };
    let payload =
        serde_json::to_vec(&request).map_err(|e| ApiError::InternalError(e.to_string()))?;
    state
        .transport
        .publish(ANALYSIS_QUEUE, &payload)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    info!(%user_id, %repo_url, "accepted submission");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "Job accepted for analysis.",
            "repoUrl": repo_url,
        })),
    ))
}

fn app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/submit", post(submit))
        .with_state(state)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let transport = Arc::new(
        AmqpTransport::connect_with_retry(
            &config.amqp_addr,
            Duration::from_secs(config.connect_retry_secs),
        )
        .await?,
    );
    transport.declare_queue(ANALYSIS_QUEUE).await?;

    let app = app(ServerState {
        transport: transport.clone(),
    });

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("shutdown signal received, closing broker connection");
    transport.close().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::queue::memory::MemoryTransport;
    use common::queue::QueueSubscription;
    use tower::ServiceExt;

    fn test_app(transport: &MemoryTransport) -> Router {
        app(ServerState {
            transport: Arc::new(transport.clone()),
        })
    }

    #[tokio::test]
    async fn health_check_responds() {
        let transport = MemoryTransport::new();
        let response = test_app(&transport)
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_submission_is_accepted_and_queued() {
        let transport = MemoryTransport::new();
        let response = test_app(&transport)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"repoUrl":"https://example.com/r.git","userId":"u1"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(transport.queue_depth(ANALYSIS_QUEUE).await, 1);
        let mut sub = transport.subscribe(ANALYSIS_QUEUE).await.expect("subscribe");
        let delivery = sub.next_delivery().await.expect("delivery").expect("message");
        let queued: AnalysisRequest = serde_json::from_slice(&delivery.payload).expect("decode");
        assert_eq!(queued.repo_url, "https://example.com/r.git");
        assert_eq!(queued.user_id, "u1");
    }

    #[tokio::test]
    async fn missing_field_is_a_bad_request() {
        let transport = MemoryTransport::new();
        let response = test_app(&transport)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"repoUrl":"https://example.com/r.git"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(transport.queue_depth(ANALYSIS_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn blank_field_is_a_bad_request() {
        let transport = MemoryTransport::new();
        let response = test_app(&transport)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"repoUrl":"  ","userId":"u1"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(transport.queue_depth(ANALYSIS_QUEUE).await, 0);
    }
}

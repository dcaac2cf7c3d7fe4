use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use crucibled_api::{ExecResponse, RunRequest};

use crate::run::{self, RunError};

pub fn app() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not Found\n") })
}

async fn health() -> &'static str {
    "ok"
}

#[tracing::instrument(skip(req), fields(id = %req.id, language = %req.language))]
async fn run_handler(Json(req): Json<RunRequest>) -> (StatusCode, Json<ExecResponse>) {
    let Some(handler) = run::handler_for(&req.language) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ExecResponse {
                message: "Unsupported language".to_owned(),
                error: format!("no handler for language {}", req.language),
                ..Default::default()
            }),
        );
    };

    if let Err(err) = tokio::fs::write(run::source_path(&req.id), &req.code).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecResponse {
                message: "Failed to write code".to_owned(),
                error: err.to_string(),
                ..Default::default()
            }),
        );
    }

    match run::execute(handler, &req).await {
        Ok(res) => (StatusCode::OK, Json(res)),
        Err(RunError::Compile {
            error,
            stdout,
            stderr,
        }) => (
            StatusCode::BAD_REQUEST,
            Json(ExecResponse {
                message: "Failed to compile".to_owned(),
                error,
                stdout,
                stderr,
                ..Default::default()
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExecResponse {
                message: "Failed to run".to_owned(),
                error: err.to_string(),
                ..Default::default()
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_languages_get_a_400() {
        let req = RunRequest {
            id: uuid::Uuid::new_v4().to_string(),
            language: "cobol".to_owned(),
            code: "DISPLAY 'hi'".to_owned(),
            variant: None,
        };
        let (status, Json(body)) = run_handler(Json(req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "Unsupported language");
        assert!(body.error.contains("cobol"));
    }

    #[tokio::test]
    async fn health_answers() {
        assert_eq!(health().await, "ok");
    }
}

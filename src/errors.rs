use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Application error taxonomy.
///
/// Client errors surface with Portuguese `detail` messages; upstream
/// failures are swallowed at the adapter boundary and only reach this
/// level as `AllSourcesFailed` or terminal pipeline errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Limite atingido")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("Trial expirado")]
    TrialExpired,

    #[error("rate limit exceeded")]
    RateLimitExceeded {
        retry_after_seconds: u64,
        correlation_id: String,
    },

    #[error("busca não encontrada")]
    SearchNotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("all sources failed: {0}")]
    AllSourcesFailed(String),

    #[error("tempo limite excedido")]
    PipelineTimeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match &self {
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                msg.clone(),
            ),
            AppError::QuotaExceeded { used, limit } => (
                StatusCode::FORBIDDEN,
                "quota_exceeded",
                format!("Limite atingido: {} de {} buscas neste mês", used, limit),
            ),
            AppError::TrialExpired => (
                StatusCode::FORBIDDEN,
                "trial_expired",
                "Trial expirado. Assine um plano para continuar.".to_string(),
            ),
            AppError::RateLimitExceeded {
                retry_after_seconds,
                correlation_id,
            } => {
                let body = Json(json!({
                    "detail": "Muitas requisições. Tente novamente em instantes.",
                    "retry_after_seconds": retry_after_seconds,
                    "correlation_id": correlation_id,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(val) =
                    axum::http::HeaderValue::from_str(&retry_after_seconds.to_string())
                {
                    response.headers_mut().insert("retry-after", val);
                }
                return response;
            }
            AppError::SearchNotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "Busca não encontrada".to_string(),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Autenticação necessária".to_string(),
            ),
            AppError::AllSourcesFailed(reason) => {
                tracing::error!("all sources failed: {}", reason);
                (
                    StatusCode::BAD_GATEWAY,
                    "all_sources_failed",
                    "Nenhuma fonte de dados respondeu. Tente novamente.".to_string(),
                )
            }
            AppError::PipelineTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "A busca excedeu o tempo limite. Tente um período menor.".to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Erro interno. Tente novamente.".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Erro interno. Tente novamente.".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Erro interno. Tente novamente.".to_string(),
                )
            }
        };

        let body = Json(json!({
            "detail": detail,
            "code": code,
        }));

        (status, body).into_response()
    }
}

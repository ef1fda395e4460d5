//! 错误到HTTP响应的映射

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use histo_core::HistoError;
use serde_json::json;

/// API错误
#[derive(Debug)]
pub enum ApiError {
    /// 工作流引擎返回的错误
    Workflow(HistoError),
    /// 缺少或无效的令牌
    Unauthorized(String),
}

impl From<HistoError> for ApiError {
    fn from(err: HistoError) -> Self {
        ApiError::Workflow(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Workflow(err) => match err {
                HistoError::NotFound { .. } => StatusCode::NOT_FOUND,
                HistoError::Forbidden { .. } => StatusCode::FORBIDDEN,
                HistoError::InvalidTransition { .. } | HistoError::Conflict { .. } => StatusCode::CONFLICT,
                HistoError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                HistoError::AllocationConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
                HistoError::Config(_)
                | HistoError::Database(_)
                | HistoError::Serialization(_)
                | HistoError::Io(_)
                | HistoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// 错误处理
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (kind, message, retryable) = match &self {
            ApiError::Unauthorized(msg) => ("unauthorized", msg.clone(), false),
            ApiError::Workflow(err) => (err.kind(), err.to_string(), err.is_retryable()),
        };

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Request failed: {}", message);
        } else {
            tracing::debug!("Request rejected ({}): {}", status.as_u16(), message);
        }

        let body = Json(json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "kind": kind,
            "message": message,
            "retryable": retryable
        }));

        (status, body).into_response()
    }
}

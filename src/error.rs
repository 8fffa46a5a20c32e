use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::playbooks::PlaybookExecutionError;
use crate::publisher::PublishError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Message(String),
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        AppError::Message(err.to_string())
    }
}

impl From<PlaybookExecutionError> for AppError {
    fn from(err: PlaybookExecutionError) -> Self {
        match err {
            PlaybookExecutionError::ExceptionNotFound { .. }
            | PlaybookExecutionError::PlaybookNotFound { .. }
            | PlaybookExecutionError::StepNotFound { .. } => AppError::NotFound,
            PlaybookExecutionError::HumanApprovalRequired { .. } => {
                AppError::Forbidden(err.to_string())
            }
            PlaybookExecutionError::WrongStep { .. }
            | PlaybookExecutionError::PlaybookNotActive { .. }
            | PlaybookExecutionError::NoCurrentStep(_) => AppError::Conflict(err.to_string()),
            PlaybookExecutionError::NoSteps(_)
            | PlaybookExecutionError::InvalidToolStep(_) => AppError::BadRequest(err.to_string()),
            PlaybookExecutionError::Database(db) => AppError::Db(db),
            other => AppError::Message(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = ?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

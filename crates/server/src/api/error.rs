//! JSON error responses shared by every endpoint.

use crate::error::{ClientError, VerificationError};
use crate::protocol::ErrorBody;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn upstream(error: &str, message: String) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            body: ErrorBody {
                error: error.to_string(),
                message,
                field: None,
                status: None,
                attempts_remaining: None,
                retry_after_seconds: None,
                restart: false,
            },
        }
    }
}

pub fn status_for(e: &VerificationError) -> StatusCode {
    match e {
        VerificationError::Validation { .. } | VerificationError::ReturnUrlRejected(_) => {
            StatusCode::BAD_REQUEST
        }
        VerificationError::ClaimMismatch | VerificationError::OtpMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        VerificationError::NotFound => StatusCode::NOT_FOUND,
        VerificationError::Expired | VerificationError::AttemptsExhausted => StatusCode::GONE,
        VerificationError::NotPending(_) => StatusCode::CONFLICT,
        VerificationError::ResendTooSoon { .. } => StatusCode::TOO_MANY_REQUESTS,
        VerificationError::Store(_) | VerificationError::RandomUnavailable => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<VerificationError> for ApiError {
    fn from(e: VerificationError) -> Self {
        if e.is_internal() {
            tracing::error!(error = %e, "internal error");
        }
        Self {
            status: status_for(&e),
            body: ErrorBody::from(&e),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Rejected(inner) => inner.into(),
            ClientError::Transport(ref detail) => {
                tracing::warn!(%detail, "authority unreachable");
                ApiError::upstream("upstream_unavailable", e.public_message())
            }
            ClientError::MalformedUpstreamResponse(ref detail) => {
                tracing::warn!(%detail, "authority answer unreadable");
                ApiError::upstream("upstream_malformed", e.public_message())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

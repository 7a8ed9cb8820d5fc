use crate::session::{TokenId, VerificationStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("token id {0} already exists")]
    Collision(TokenId),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Business failures of the token authority and the flows built on it.
///
/// Every variant is per-session and recoverable by the subject; none of them
/// should take the process down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("submitted claims do not match the verification session")]
    ClaimMismatch,
    #[error("verification window has expired")]
    Expired,
    #[error("operation not allowed while the session is {0}")]
    NotPending(VerificationStatus),
    #[error("one-time code does not match ({attempts_remaining} attempts remaining)")]
    OtpMismatch { attempts_remaining: u32 },
    #[error("too many incorrect codes")]
    AttemptsExhausted,
    #[error("a new code can be requested in {retry_after_seconds}s")]
    ResendTooSoon { retry_after_seconds: i64 },
    #[error("verification session not found")]
    NotFound,
    #[error("return URL is not allowed: {0}")]
    ReturnUrlRejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("random source unavailable")]
    RandomUnavailable,
}

impl VerificationError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        VerificationError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            VerificationError::Validation { .. } => "validation_error",
            VerificationError::ClaimMismatch => "claim_mismatch",
            VerificationError::Expired => "expired",
            VerificationError::NotPending(_) => "not_pending",
            VerificationError::OtpMismatch { .. } => "otp_mismatch",
            VerificationError::AttemptsExhausted => "attempts_exhausted",
            VerificationError::ResendTooSoon { .. } => "resend_too_soon",
            VerificationError::NotFound => "not_found",
            VerificationError::ReturnUrlRejected(_) => "return_url_rejected",
            VerificationError::Store(_) | VerificationError::RandomUnavailable => "server_error",
        }
    }

    /// Whether the subject has to start over from `init`.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            VerificationError::Expired
                | VerificationError::AttemptsExhausted
                | VerificationError::NotFound
                | VerificationError::NotPending(
                    VerificationStatus::Expired | VerificationStatus::Failed
                )
        )
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            VerificationError::Store(_) | VerificationError::RandomUnavailable
        )
    }
}

/// Failures seen by a caller of the authority, local or remote.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authority unreachable: {0}")]
    Transport(String),
    #[error(transparent)]
    Rejected(#[from] VerificationError),
    #[error("malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }

    /// Message safe to show to the subject. Transport detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ClientError::Transport(_) => {
                "The verification service could not be reached. Please try again.".to_string()
            }
            ClientError::Rejected(e) if e.is_internal() => {
                "An error occurred. Please try again.".to_string()
            }
            ClientError::Rejected(e) => e.to_string(),
            ClientError::MalformedUpstreamResponse(_) => {
                "The verification result could not be read.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::MalformedUpstreamResponse(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

//! Wire types for the token authority. Shared by the HTTP handlers and
//! [`crate::client::HttpAuthorityClient`].

use crate::error::VerificationError;
use crate::session::{TokenId, VerificationStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub name: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    /// Correlation id of the initiating caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_request_id: Option<String>,
    /// Absolute URL the subject returns to. Must belong to a registered origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub token_id: TokenId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpRequest {
    pub token_id: TokenId,
    pub name: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpIssued {
    pub token_id: TokenId,
    pub expires_in_seconds: i64,
    pub resend_after_seconds: i64,
    /// Only present when the deployment runs in demo mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub token_id: TokenId,
    pub otp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub token_id: TokenId,
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Only disclosed once the session is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Return URL registered at init. The provider redirects nowhere else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
}

/// Error body returned by every authority endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
    /// Set when the subject has to start over from init.
    #[serde(default)]
    pub restart: bool,
}

impl From<&VerificationError> for ErrorBody {
    fn from(e: &VerificationError) -> Self {
        let message = if e.is_internal() {
            "An error occurred. Please try again.".to_string()
        } else {
            e.to_string()
        };
        let mut body = ErrorBody {
            error: e.code().to_string(),
            message,
            field: None,
            status: None,
            attempts_remaining: None,
            retry_after_seconds: None,
            restart: e.requires_restart(),
        };
        match e {
            VerificationError::Validation { field, .. } => body.field = Some(field.clone()),
            VerificationError::NotPending(status) => body.status = Some(*status),
            VerificationError::OtpMismatch { attempts_remaining } => {
                body.attempts_remaining = Some(*attempts_remaining)
            }
            VerificationError::ResendTooSoon {
                retry_after_seconds,
            } => body.retry_after_seconds = Some(*retry_after_seconds),
            _ => {}
        }
        body
    }
}

impl ErrorBody {
    /// Rebuild the business error a remote authority reported.
    /// Returns `None` for codes this client does not know.
    pub fn into_error(self) -> Option<VerificationError> {
        let e = match self.error.as_str() {
            "validation_error" => VerificationError::Validation {
                field: self.field.unwrap_or_default(),
                reason: self.message,
            },
            "claim_mismatch" => VerificationError::ClaimMismatch,
            "expired" => VerificationError::Expired,
            "not_pending" => VerificationError::NotPending(self.status?),
            "otp_mismatch" => VerificationError::OtpMismatch {
                attempts_remaining: self.attempts_remaining.unwrap_or(0),
            },
            "attempts_exhausted" => VerificationError::AttemptsExhausted,
            "resend_too_soon" => VerificationError::ResendTooSoon {
                retry_after_seconds: self.retry_after_seconds.unwrap_or(0),
            },
            "not_found" => VerificationError::NotFound,
            "return_url_rejected" => VerificationError::ReturnUrlRejected(self.message),
            _ => return None,
        };
        Some(e)
    }
}

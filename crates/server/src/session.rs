//! Verification session data model.

use crate::error::VerificationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Opaque session identifier handed to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(raw: impl Into<String>) -> Self {
        TokenId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TokenId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    OtpSent,
    Confirmed,
    Expired,
    Failed,
}

impl VerificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VerificationStatus::Confirmed | VerificationStatus::Expired | VerificationStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::OtpSent => "OTP_SENT",
            VerificationStatus::Confirmed => "CONFIRMED",
            VerificationStatus::Expired => "EXPIRED",
            VerificationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(VerificationStatus::Pending),
            "OTP_SENT" => Ok(VerificationStatus::OtpSent),
            "CONFIRMED" => Ok(VerificationStatus::Confirmed),
            "EXPIRED" => Ok(VerificationStatus::Expired),
            "FAILED" => Ok(VerificationStatus::Failed),
            other => Err(format!("unknown status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    ClaimMismatch,
    AttemptsExhausted,
}

/// Mobile carriers the provider accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Carrier {
    #[serde(rename = "SKT")]
    Skt,
    #[serde(rename = "KT")]
    Kt,
    #[serde(rename = "LGU+")]
    LguPlus,
    /// MVNO ("budget") lines.
    #[serde(rename = "ALDDLE")]
    Alddle,
}

impl Carrier {
    pub fn as_str(self) -> &'static str {
        match self {
            Carrier::Skt => "SKT",
            Carrier::Kt => "KT",
            Carrier::LguPlus => "LGU+",
            Carrier::Alddle => "ALDDLE",
        }
    }
}

impl FromStr for Carrier {
    type Err = VerificationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "SKT" => Ok(Carrier::Skt),
            "KT" => Ok(Carrier::Kt),
            "LGU+" => Ok(Carrier::LguPlus),
            "ALDDLE" => Ok(Carrier::Alddle),
            other => Err(VerificationError::validation(
                "carrier",
                format!("unknown carrier '{other}'"),
            )),
        }
    }
}

/// Strip everything but ASCII digits.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Phone rendering for logs: keeps the prefix and the last four digits.
pub fn mask_phone(phone: &str) -> String {
    let digits = normalize_phone(phone);
    if digits.len() < 7 {
        return "*".repeat(digits.len());
    }
    let (head, rest) = digits.split_at(3);
    let tail = &rest[rest.len() - 4..];
    format!("{head}{}{tail}", "*".repeat(rest.len() - 4))
}

/// Subject claims as supplied by the relying application at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub name: String,
    pub phone: String,
    pub carrier: Option<Carrier>,
    pub auth_request_id: Option<String>,
}

impl Claims {
    /// Validate and canonicalize raw claims.
    pub fn parse(
        name: &str,
        phone: &str,
        carrier: Option<&str>,
        auth_request_id: Option<&str>,
    ) -> Result<Self, VerificationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VerificationError::validation("name", "must not be empty"));
        }
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(VerificationError::validation(
                "phoneNumber",
                "must not be empty",
            ));
        }
        if !(10..=11).contains(&phone.len()) {
            return Err(VerificationError::validation(
                "phoneNumber",
                "must have 10 or 11 digits",
            ));
        }
        let carrier = match carrier.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => Some(c.parse()?),
            None => None,
        };
        Ok(Claims {
            name: name.to_string(),
            phone,
            carrier,
            auth_request_id: auth_request_id
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    pub fn matches(&self, name: &str, phone: &str) -> bool {
        self.name == name.trim() && self.phone == normalize_phone(phone)
    }
}

#[derive(Debug, Clone)]
pub struct VerificationSession {
    pub token_id: TokenId,
    pub claims: Claims,
    pub return_url: Option<String>,
    pub status: VerificationStatus,
    /// Only meaningful while `status` is `OtpSent`.
    pub otp_code: Option<String>,
    pub otp_issued_at: Option<OffsetDateTime>,
    pub ttl_seconds: i64,
    pub failed_attempts: u32,
    pub failure_reason: Option<FailureReason>,
    pub created_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

impl VerificationSession {
    pub fn new(
        token_id: TokenId,
        claims: Claims,
        return_url: Option<String>,
        ttl_seconds: i64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            token_id,
            claims,
            return_url,
            status: VerificationStatus::Pending,
            otp_code: None,
            otp_issued_at: None,
            ttl_seconds,
            failed_attempts: 0,
            failure_reason: None,
            created_at: now,
            resolved_at: None,
        }
    }

    /// True once more than `ttl_seconds` have passed since the last issuance.
    pub fn otp_expired(&self, now: OffsetDateTime) -> bool {
        match self.otp_issued_at {
            Some(issued) => (now - issued).whole_seconds() > self.ttl_seconds,
            None => false,
        }
    }

    /// Status as observed at `now`, with lapsed windows reported as `Expired`.
    /// Does not modify the session.
    pub fn effective_status(&self, now: OffsetDateTime, pending_ttl_seconds: i64) -> VerificationStatus {
        match self.status {
            VerificationStatus::OtpSent if self.otp_expired(now) => VerificationStatus::Expired,
            VerificationStatus::Pending
                if (now - self.created_at).whole_seconds() > pending_ttl_seconds =>
            {
                VerificationStatus::Expired
            }
            status => status,
        }
    }

    /// Move to a terminal state. The code is dropped so it can never be compared again.
    pub fn resolve(&mut self, status: VerificationStatus, now: OffsetDateTime) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.otp_code = None;
        self.resolved_at = Some(now);
    }

    pub fn fail(&mut self, reason: FailureReason, now: OffsetDateTime) {
        self.failure_reason = Some(reason);
        self.resolve(VerificationStatus::Failed, now);
    }
}

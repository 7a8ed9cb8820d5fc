//! The callback answer sent to the browser, and the reader for answers coming back.
//!
//! Relying back ends in the wild answer the callback with anything from
//! `{"status":"success"}` to a bare `verified successfully`. [`normalize_callback_body`]
//! settles such a body with a fixed precedence:
//!
//! 1. the body is size and structure bounded before parsing
//! 2. a JSON object with a string `status` is a success iff it equals `success`
//! 3. a JSON object with a string `message` is a success iff it mentions `success`
//! 4. any other JSON is malformed
//! 5. non-JSON text (legacy fallback only) is a success iff it mentions `success`,
//!    and empty text is malformed
//!
//! A non-2xx answer is never a success. String checks are case-insensitive.

use super::{CallbackOutcome, RestartReason};
use crate::error::ClientError;
use crate::security::{BodyLimitError, BoundedBodyParser};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Success,
    Error,
}

/// Typed answer of the relying callback endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub status: CallbackStatus,
    /// Kind of the resumed or restarted flow, absent when no flow was pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Where the browser goes next.
    pub next: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The same callback may be retried as is.
    #[serde(default)]
    pub retryable: bool,
}

impl From<&CallbackOutcome> for CallbackResponse {
    fn from(outcome: &CallbackOutcome) -> Self {
        match outcome {
            CallbackOutcome::Resume { flow, subject } => CallbackResponse {
                status: CallbackStatus::Success,
                flow: Some(flow.kind().to_string()),
                name: Some(subject.name.clone()),
                phone_number: Some(subject.phone.clone()),
                next: flow.resume_path(),
                reason: None,
                retryable: false,
            },
            CallbackOutcome::Restart { flow, reason } => CallbackResponse {
                status: CallbackStatus::Error,
                flow: flow.as_ref().map(|f| f.kind().to_string()),
                name: None,
                phone_number: None,
                next: flow
                    .as_ref()
                    .map(|f| f.entry_path())
                    .unwrap_or_else(|| "/".to_string()),
                reason: Some(reason.user_message().to_string()),
                retryable: false,
            },
            CallbackOutcome::Unavailable { flow } => CallbackResponse {
                status: CallbackStatus::Error,
                flow: Some(flow.kind().to_string()),
                name: None,
                phone_number: None,
                next: flow.entry_path(),
                reason: Some(RestartReason::Unavailable.user_message().to_string()),
                retryable: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamVerdict {
    Success,
    Failure,
}

impl UpstreamVerdict {
    fn from_bool(success: bool) -> Self {
        if success {
            UpstreamVerdict::Success
        } else {
            UpstreamVerdict::Failure
        }
    }

    pub fn is_success(self) -> bool {
        self == UpstreamVerdict::Success
    }
}

fn mentions_success(text: &str) -> bool {
    text.to_lowercase().contains("success")
}

/// Settle an upstream callback body. See the module docs for the precedence.
pub fn normalize_callback_body(
    http_ok: bool,
    body: &[u8],
    accept_legacy_text: bool,
) -> Result<UpstreamVerdict, ClientError> {
    let verdict = match BoundedBodyParser::default().parse_json(body) {
        Ok(Value::Object(map)) => match (map.get("status"), map.get("message")) {
            (Some(Value::String(status)), _) => status.eq_ignore_ascii_case("success"),
            (_, Some(Value::String(message))) => mentions_success(message),
            _ => {
                return Err(ClientError::MalformedUpstreamResponse(
                    "object carries neither status nor message".to_string(),
                ));
            }
        },
        Ok(other) => {
            return Err(ClientError::MalformedUpstreamResponse(format!(
                "unexpected JSON {}",
                json_kind(&other)
            )));
        }
        Err(BodyLimitError::NotJson(_)) if accept_legacy_text => {
            let text = String::from_utf8_lossy(body);
            if text.trim().is_empty() {
                return Err(ClientError::MalformedUpstreamResponse(
                    "empty body".to_string(),
                ));
            }
            mentions_success(&text)
        }
        Err(e) => return Err(ClientError::MalformedUpstreamResponse(e.to_string())),
    };
    Ok(UpstreamVerdict::from_bool(http_ok && verdict))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reads a relying back end's callback answer the way a browser front end would.
#[derive(Debug, Clone)]
pub struct CallbackReader {
    http: reqwest::Client,
    accept_legacy_text: bool,
}

impl CallbackReader {
    pub fn new(http: reqwest::Client, accept_legacy_text: bool) -> Self {
        Self {
            http,
            accept_legacy_text,
        }
    }

    /// Follow `callback_url` (already carrying the return parameters) and settle the answer.
    #[tracing::instrument(skip(self, context_cookie), fields(url = %callback_url))]
    pub async fn read(
        &self,
        callback_url: &Url,
        context_cookie: Option<&str>,
    ) -> Result<UpstreamVerdict, ClientError> {
        let mut request = self.http.get(callback_url.clone());
        if let Some(cookie) = context_cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let response = request.send().await?;
        let http_ok = response.status().is_success();
        let body = response.bytes().await?;
        let verdict = normalize_callback_body(http_ok, &body, self.accept_legacy_text)?;
        tracing::debug!(http_ok, success = verdict.is_success(), "callback answer read");
        Ok(verdict)
    }
}

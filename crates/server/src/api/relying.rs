//! Relying application endpoints.
//!
//! - `POST /verifications` - begin a verification for a business flow
//! - `GET /callback` - settle the browser's return from the provider
//! - `GET /landing` - read a relying back end's callback answer for the browser
//!
//! The browser context is carried in the `ph_ctx` cookie. It keys the single-use
//! flow markers and is never trusted for anything else.

use crate::AppResources;
use crate::api::error::ApiError;
use crate::callback::response::{CallbackResponse, CallbackStatus};
use crate::callback::{BusinessFlow, CallbackOutcome, CallbackParams, SubjectClaims};
use crate::protocol::ErrorBody;
use crate::tokens::generate_context_id;
use axum::{
    Extension, Json,
    extract::{Query, RawQuery},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Tag for OpenAPI documentation.
pub const RELYING_TAG: &str = "Relying Application";

pub const CONTEXT_COOKIE: &str = "ph_ctx";

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(begin_verification))
        .routes(routes!(callback))
        .routes(routes!(landing))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeginVerification {
    pub flow: BusinessFlow,
    pub name: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffView {
    pub provider_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LandingView {
    pub status: CallbackStatus,
}

/// Value of the context cookie, if the browser sent one.
pub fn context_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CONTEXT_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|v| is_context_id(v))
        .map(str::to_string)
}

/// Context ids are base64url. Anything else is ignored and replaced.
fn is_context_id(value: &str) -> bool {
    (1..=64).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn context_cookie(context_id: &str) -> Result<HeaderValue, ApiError> {
    // Lax so the cookie survives the top-level navigation back from the provider.
    HeaderValue::from_str(&format!(
        "{CONTEXT_COOKIE}={context_id}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .map_err(|_| ApiError::from(crate::error::VerificationError::RandomUnavailable))
}

#[tracing::instrument(skip_all, fields(flow = payload.flow.kind()))]
#[utoipa::path(
    post,
    path = "/verifications",
    tag = RELYING_TAG,
    operation_id = "Begin Verification",
    summary = "Hand a business flow off to the provider",
    description = "Opens a session at the authority, remembers which flow started it for this browser \
                   and answers with the provider URL to navigate to.",
    request_body = BeginVerification,
    responses(
        (status = 200, description = "Provider URL", body = HandoffView),
        (status = 400, description = "Invalid claims", body = ErrorBody),
        (status = 502, description = "Authority unreachable", body = ErrorBody)
    )
)]
async fn begin_verification(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Json(payload): Json<BeginVerification>,
) -> Result<Response, ApiError> {
    let context_id = match context_from_headers(&headers) {
        Some(ctx) => ctx,
        None => generate_context_id()?,
    };
    let provider_url = resources
        .resolver
        .begin(
            &context_id,
            payload.flow,
            SubjectClaims {
                name: payload.name,
                phone_number: payload.phone_number,
                carrier: payload.carrier,
            },
            &resources.callback_url,
        )
        .await?;

    let mut response = Json(HandoffView {
        provider_url: provider_url.to_string(),
    })
    .into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, context_cookie(&context_id)?);
    Ok(response)
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/callback",
    tag = RELYING_TAG,
    operation_id = "Verification Callback",
    summary = "Settle the browser's return",
    description = "Re-queries the authority for the token on the query string. Claims on the query \
                   string are advisory and never used. Resumes the pending flow on success, otherwise \
                   points back at the flow's entry.",
    params(CallbackParams),
    responses(
        (status = 200, description = "Flow resumed", body = CallbackResponse),
        (status = 400, description = "Flow must restart", body = CallbackResponse),
        (status = 503, description = "Authority unreachable, retry the same callback", body = CallbackResponse)
    )
)]
async fn callback(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Json<CallbackResponse>) {
    let context_id = context_from_headers(&headers);
    let outcome = resources
        .resolver
        .resolve(context_id.as_deref(), &params)
        .await;
    let body = CallbackResponse::from(&outcome);
    let status = match (&outcome, body.status) {
        (CallbackOutcome::Unavailable { .. }, _) => StatusCode::SERVICE_UNAVAILABLE,
        (_, CallbackStatus::Success) => StatusCode::OK,
        (_, CallbackStatus::Error) => StatusCode::BAD_REQUEST,
    };
    (status, Json(body))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/landing",
    tag = RELYING_TAG,
    operation_id = "Verification Landing",
    summary = "Settle a relying back end's callback answer",
    description = "Forwards the return query and the context cookie to the configured relying back end \
                   and settles its answer, which may be JSON or, when enabled, legacy plain text. \
                   An error status from the back end is never a success.",
    responses(
        (status = 200, description = "Back end reported success", body = LandingView),
        (status = 400, description = "Back end reported failure", body = LandingView),
        (status = 502, description = "Back end unreachable or its answer unreadable", body = ErrorBody)
    )
)]
async fn landing(
    Extension(resources): Extension<AppResources>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<(StatusCode, Json<LandingView>), ApiError> {
    let mut target = resources.callback_backend_url.clone();
    if let Some(query) = query.as_deref().filter(|q| !q.is_empty()) {
        target
            .query_pairs_mut()
            .extend_pairs(form_urlencoded::parse(query.as_bytes()));
    }
    let cookie = context_from_headers(&headers).map(|ctx| format!("{CONTEXT_COOKIE}={ctx}"));

    let verdict = resources
        .callback_reader
        .read(&target, cookie.as_deref())
        .await?;
    Ok(if verdict.is_success() {
        (
            StatusCode::OK,
            Json(LandingView {
                status: CallbackStatus::Success,
            }),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(LandingView {
                status: CallbackStatus::Error,
            }),
        )
    })
}

//! Verification provider endpoints.
//!
//! - `GET /entry` - decode and check the handoff query
//! - `POST /request-otp` - submit supplementary attributes and get a code sent
//! - `POST /confirm` - confirm the code, answer with the redirect back

use crate::AppResources;
use crate::api::error::ApiError;
use crate::handoff::ProviderEntry;
use crate::protocol::{ErrorBody, OtpIssued};
use crate::provider::SubjectAttributes;
use crate::session::TokenId;
use axum::{Extension, Json, extract::RawQuery};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Tag for OpenAPI documentation.
pub const PROVIDER_TAG: &str = "Verification Provider";

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(entry))
        .routes(routes!(request_otp))
        .routes(routes!(confirm))
}

/// Prefill for the provider form. Display only.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub token_id: TokenId,
    pub name: String,
    pub phone_number: String,
    pub return_url: String,
    pub otp_ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOtpRequest {
    pub token_id: TokenId,
    #[serde(flatten)]
    pub attributes: SubjectAttributes,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfirmRequest {
    pub token_id: TokenId,
    pub otp: String,
    pub return_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedirectView {
    pub redirect_url: String,
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/entry",
    tag = PROVIDER_TAG,
    operation_id = "Provider Entry",
    summary = "Decode the handoff query",
    description = "Accepts `tokenId`, `name`, `phoneNumber` and `returnUrl` (or the older `redirectUrl`). \
                   Refuses return URLs outside the registered origins.",
    responses(
        (status = 200, description = "Entry accepted", body = EntryView),
        (status = 400, description = "Missing token or rejected return URL", body = ErrorBody)
    )
)]
async fn entry(
    Extension(resources): Extension<AppResources>,
    RawQuery(query): RawQuery,
) -> Result<Json<EntryView>, ApiError> {
    let entry = ProviderEntry::from_query(query.as_deref().unwrap_or_default())?;
    let return_url = resources
        .provider
        .check_return_url(entry.return_url.as_deref())?;
    Ok(Json(EntryView {
        token_id: entry.token_id,
        name: entry.prefill.name,
        phone_number: entry.prefill.phone_number,
        return_url: return_url.to_string(),
        otp_ttl_seconds: resources.authority.policy().otp_ttl_seconds,
    }))
}

#[tracing::instrument(skip_all, fields(token_id = %payload.token_id))]
#[utoipa::path(
    post,
    path = "/request-otp",
    tag = PROVIDER_TAG,
    operation_id = "Provider Request OTP",
    summary = "Submit attributes and send a code",
    request_body = ProviderOtpRequest,
    responses(
        (status = 200, description = "Code issued", body = OtpIssued),
        (status = 400, description = "Invalid attributes", body = ErrorBody),
        (status = 422, description = "Attributes do not match", body = ErrorBody),
        (status = 429, description = "Resend cooldown still running", body = ErrorBody)
    )
)]
async fn request_otp(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<ProviderOtpRequest>,
) -> Result<Json<OtpIssued>, ApiError> {
    let (_, issued) = resources
        .provider
        .request_otp(&payload.token_id, &payload.attributes)
        .await?;
    Ok(Json(issued))
}

#[tracing::instrument(skip_all, fields(token_id = %payload.token_id))]
#[utoipa::path(
    post,
    path = "/confirm",
    tag = PROVIDER_TAG,
    operation_id = "Provider Confirm OTP",
    summary = "Confirm the code",
    description = "On success answers with the URL the browser should be sent back to.",
    request_body = ProviderConfirmRequest,
    responses(
        (status = 200, description = "Confirmed", body = RedirectView),
        (status = 400, description = "Malformed code or rejected return URL", body = ErrorBody),
        (status = 410, description = "Code expired or attempts exhausted", body = ErrorBody),
        (status = 422, description = "Code does not match", body = ErrorBody)
    )
)]
async fn confirm(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<ProviderConfirmRequest>,
) -> Result<Json<RedirectView>, ApiError> {
    let redirect = resources
        .provider
        .confirm(&payload.token_id, &payload.otp, &payload.return_url)
        .await?;
    Ok(Json(RedirectView {
        redirect_url: redirect.to_string(),
    }))
}

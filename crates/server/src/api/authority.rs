//! Token authority endpoints.
//!
//! - `POST /init` - open a verification session
//! - `POST /request-otp` - issue or re-issue a one-time code
//! - `PATCH /confirm` - confirm a one-time code
//! - `GET /status/{token_id}` - authoritative session status

use crate::AppResources;
use crate::api::error::ApiError;
use crate::protocol::{
    ConfirmRequest, ErrorBody, InitRequest, InitResponse, OtpIssued, OtpRequest, StatusView,
};
use crate::session::{Claims, TokenId};
use axum::{
    Extension, Json,
    extract::Path,
    http::StatusCode,
};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Tag for OpenAPI documentation.
pub const AUTHORITY_TAG: &str = "Token Authority";

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(init))
        .routes(routes!(request_otp))
        .routes(routes!(confirm))
        .routes(routes!(status))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/init",
    tag = AUTHORITY_TAG,
    operation_id = "Init Verification",
    summary = "Open a verification session",
    description = "Stores the subject's claims and returns an opaque token id. \
                   The one-time code is never part of the answer.",
    request_body = InitRequest,
    responses(
        (status = 200, description = "Session opened", body = InitResponse),
        (status = 400, description = "Invalid claims or return URL", body = ErrorBody),
        (status = 500, description = "Session could not be stored", body = ErrorBody)
    )
)]
async fn init(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    let claims = Claims::parse(
        &payload.name,
        &payload.phone_number,
        payload.carrier.as_deref(),
        payload.auth_request_id.as_deref(),
    )?;
    let token_id = resources
        .authority
        .init(claims, payload.return_url.as_deref())
        .await?;
    Ok(Json(InitResponse { token_id }))
}

#[tracing::instrument(skip_all, fields(token_id = %payload.token_id))]
#[utoipa::path(
    post,
    path = "/request-otp",
    tag = AUTHORITY_TAG,
    operation_id = "Request OTP",
    summary = "Issue a one-time code",
    description = "Checks the submitted claims against the session and issues a fresh code. \
                   Calling it again after the cooldown resends a new code and restarts the window.",
    request_body = OtpRequest,
    responses(
        (status = 200, description = "Code issued", body = OtpIssued),
        (status = 404, description = "Unknown token", body = ErrorBody),
        (status = 409, description = "Session already settled", body = ErrorBody),
        (status = 410, description = "Session expired", body = ErrorBody),
        (status = 422, description = "Claims do not match", body = ErrorBody),
        (status = 429, description = "Resend cooldown still running", body = ErrorBody)
    )
)]
async fn request_otp(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<OtpRequest>,
) -> Result<Json<OtpIssued>, ApiError> {
    let issued = resources
        .authority
        .request_otp(&payload.token_id, &payload.name, &payload.phone_number)
        .await?;
    Ok(Json(issued))
}

#[tracing::instrument(skip_all, fields(token_id = %payload.token_id))]
#[utoipa::path(
    patch,
    path = "/confirm",
    tag = AUTHORITY_TAG,
    operation_id = "Confirm OTP",
    summary = "Confirm a one-time code",
    request_body = ConfirmRequest,
    responses(
        (status = 204, description = "Session confirmed"),
        (status = 404, description = "Unknown token", body = ErrorBody),
        (status = 409, description = "No code outstanding", body = ErrorBody),
        (status = 410, description = "Code expired or attempts exhausted", body = ErrorBody),
        (status = 422, description = "Code does not match", body = ErrorBody)
    )
)]
async fn confirm(
    Extension(resources): Extension<AppResources>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<StatusCode, ApiError> {
    resources
        .authority
        .confirm_otp(&payload.token_id, &payload.otp)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all, fields(token_id = %token_id))]
#[utoipa::path(
    get,
    path = "/status/{token_id}",
    tag = AUTHORITY_TAG,
    operation_id = "Verification Status",
    summary = "Authoritative session status",
    description = "Side-effect free. The phone number is only disclosed once the session is confirmed.",
    params(("token_id" = String, Path, description = "Token id returned by init")),
    responses(
        (status = 200, description = "Current status", body = StatusView),
        (status = 404, description = "Unknown token", body = ErrorBody)
    )
)]
async fn status(
    Extension(resources): Extension<AppResources>,
    Path(token_id): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    let view = resources.authority.status(&TokenId::new(token_id)).await?;
    Ok(Json(view))
}

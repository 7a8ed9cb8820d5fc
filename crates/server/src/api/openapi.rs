//! OpenAPI/Utoipa configuration.

use crate::api::{
    authority::AUTHORITY_TAG, health::MISC_TAG, provider::PROVIDER_TAG, relying::RELYING_TAG,
};
use utoipa::OpenApi;

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Phone Handoff API",
        version = "1.0.0",
        description = "Token authority, verification provider and relying callback for \
                       phone ownership verification through a browser handoff."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = AUTHORITY_TAG, description = "Verification session lifecycle"),
        (name = PROVIDER_TAG, description = "Provider form and OTP submission"),
        (name = RELYING_TAG, description = "Relying application handoff and callback")
    )
)]
pub struct ApiDoc;

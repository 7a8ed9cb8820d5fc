//! HTTP surface.
//!
//! - `authority` - token authority (/api/v1/auth/*)
//! - `provider` - verification provider (/api/v1/provider/*)
//! - `relying` - relying application handoff and callback (/api/v1/relying/*)
//! - `health` - health check (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration, rendered at /api-docs

pub mod authority;
pub mod error;
pub mod health;
pub mod openapi;
pub mod provider;
pub mod relying;

pub use authority::AUTHORITY_TAG;
pub use error::ApiError;
pub use health::MISC_TAG;
pub use provider::PROVIDER_TAG;
pub use relying::RELYING_TAG;

use crate::AppResources;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Build the application router with all routes and layers.
pub fn app(resources: AppResources) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/api/v1/auth", authority::router())
        .nest("/api/v1/provider", provider::router())
        .nest("/api/v1/relying", relying::router())
        .routes(routes!(health::health))
        .layer(axum::Extension(resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(resources))]
pub async fn start_webserver(resources: AppResources) -> color_eyre::Result<()> {
    let addr = resources.config.listen_addr;
    let router = app(resources);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}

use phone_handoff::AppResources;
use phone_handoff::api::start_webserver;
use phone_handoff::authority::spawn_sweep_task;
use phone_handoff::config::load_config_or_panic;
use phone_handoff::logging::init_tracing;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    // A missing .env is fine; config.yaml and the real environment still apply.
    let dotenv = dotenvy::dotenv();

    init_tracing();
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let config = load_config_or_panic();
    if config.demo.expose_otp {
        tracing::warn!("demo.expose_otp is enabled: one-time codes are returned to callers");
    }
    if config.carriers.is_empty() {
        tracing::info!("no carrier directory configured, directory check disabled");
    }
    let sweep_every = Duration::from_secs(config.session.sweep_interval_seconds);

    let resources = AppResources::new(config)?;
    tracing::info!(
        otp_ttl_seconds = resources.config.session.otp_ttl_seconds,
        max_otp_attempts = resources.config.session.max_otp_attempts,
        retention_seconds = resources.config.session.retention_seconds,
        provider_entry = %resources.config.provider_entry_url,
        "session configuration"
    );

    // Expire lapsed sessions and purge settled ones in the background.
    spawn_sweep_task(resources.authority.clone(), sweep_every);

    start_webserver(resources).await?;
    Ok(())
}

//! Phone ownership verification through a browser handoff.
//!
//! A relying application opens a session at the token authority, hands the browser to
//! a verification provider with the session's token id, and settles the browser's
//! return by asking the authority for the session status.

use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::authority::{LogOtpSender, OtpSender, SessionPolicy, TokenAuthority};
use crate::callback::CallbackResolver;
use crate::callback::response::CallbackReader;
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, ConfigError};
use crate::handoff::HandoffBuilder;
use crate::provider::{Provider, StaticCarrierDirectory};
use crate::store::MemoryRepository;

pub mod api;
pub mod authority;
pub mod callback;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod protocol;
pub mod provider;
pub mod security;
pub mod session;
pub mod store;
pub mod tokens;

pub type Authority = TokenAuthority<MemoryRepository>;

#[derive(Clone)]
pub struct AppResources {
    pub config: Arc<AppConfig>,
    pub authority: Arc<Authority>,
    pub provider: Arc<Provider<Arc<Authority>>>,
    pub resolver: Arc<CallbackResolver<Arc<Authority>>>,
    /// Relying callback route the provider sends browsers back to.
    pub callback_url: Url,
    /// Callback answers read on the browser's behalf by `/landing`.
    pub callback_reader: CallbackReader,
    pub callback_backend_url: Url,
}

impl AppResources {
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(LogOtpSender))
    }

    /// Wire everything around one in-memory authority.
    pub fn with_parts(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn OtpSender>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let return_urls = config.return_url_policy()?;
        let callback_url = config.relying_callback_url()?;

        let mut policy = SessionPolicy::from(&config.session);
        policy.expose_otp = config.demo.expose_otp;

        let authority = Arc::new(
            TokenAuthority::new(MemoryRepository::new(), policy, return_urls.clone())
                .with_clock(clock)
                .with_sender(sender),
        );
        let provider = Provider::new(
            authority.clone(),
            StaticCarrierDirectory::new(config.carriers.iter().cloned()),
            return_urls.clone(),
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConfigError::Validation(format!("http client: {e}")))?;
        let callback_reader = CallbackReader::new(http, config.callback.accept_legacy_text);
        let callback_backend_url = config
            .callback
            .backend_url
            .clone()
            .unwrap_or_else(|| callback_url.clone());

        let resolver = CallbackResolver::new(
            authority.clone(),
            HandoffBuilder::new(config.provider_entry_url.clone(), return_urls),
        );

        Ok(Self {
            config: Arc::new(config),
            authority,
            provider: Arc::new(provider),
            resolver: Arc::new(resolver),
            callback_url,
            callback_reader,
            callback_backend_url,
        })
    }
}

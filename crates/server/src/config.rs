use crate::handoff::ReturnUrlPolicy;
use crate::provider::CarrierRecord;
use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Session windows and limits, all in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub otp_ttl_seconds: i64,
    /// How long a session may sit in PENDING before it is expired.
    pub pending_ttl_seconds: i64,
    pub max_otp_attempts: u32,
    pub resend_cooldown_seconds: i64,
    /// How long settled sessions stay queryable before the sweep purges them.
    pub retention_seconds: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            otp_ttl_seconds: 180,
            pending_ttl_seconds: 600,
            max_otp_attempts: 5,
            resend_cooldown_seconds: 30,
            retention_seconds: 600,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Accept plain-text callback answers mentioning "success".
    pub accept_legacy_text: bool,
    /// Relying back end whose callback answers `/landing` settles for the browser.
    /// Defaults to this deployment's relying callback route.
    pub backend_url: Option<Url>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            accept_legacy_text: true,
            backend_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Return issued codes in API responses. Never enable outside a demo.
    pub expose_otp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Externally reachable base URL of this deployment.
    pub public_base_url: Url,
    /// Provider page the relying side hands the browser to.
    pub provider_entry_url: Url,
    /// Where the provider sends the browser back. Defaults to the relying callback route.
    #[serde(default)]
    pub relying_callback_url: Option<Url>,
    /// Origins return URLs may point at. The public base URL is always allowed.
    #[serde(default)]
    pub allowed_return_origins: Vec<String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    /// Optional carrier directory seed. Empty disables the directory check.
    #[serde(default)]
    pub carriers: Vec<CarrierRecord>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("public_base_url", &self.public_base_url),
            ("provider_entry_url", &self.provider_entry_url),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Validation(format!(
                    "{name} must be an http(s) URL"
                )));
            }
        }
        let s = &self.session;
        if s.otp_ttl_seconds <= 0 {
            return Err(ConfigError::Validation(
                "session.otp_ttl_seconds must be > 0".into(),
            ));
        }
        if s.pending_ttl_seconds <= 0 {
            return Err(ConfigError::Validation(
                "session.pending_ttl_seconds must be > 0".into(),
            ));
        }
        if s.max_otp_attempts == 0 {
            return Err(ConfigError::Validation(
                "session.max_otp_attempts must be > 0".into(),
            ));
        }
        if s.resend_cooldown_seconds < 0 || s.resend_cooldown_seconds >= s.otp_ttl_seconds {
            return Err(ConfigError::Validation(
                "session.resend_cooldown_seconds must be between 0 and otp_ttl_seconds".into(),
            ));
        }
        if s.retention_seconds < 0 {
            return Err(ConfigError::Validation(
                "session.retention_seconds must be >= 0".into(),
            ));
        }
        if s.sweep_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "session.sweep_interval_seconds must be > 0".into(),
            ));
        }
        if let Some(url) = &self.callback.backend_url {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Validation(
                    "callback.backend_url must be an http(s) URL".into(),
                ));
            }
        }
        self.return_url_policy()?;
        Ok(())
    }

    /// Where relying flows ask the provider to send the browser back.
    pub fn relying_callback_url(&self) -> Result<Url, ConfigError> {
        match &self.relying_callback_url {
            Some(url) => Ok(url.clone()),
            None => self
                .public_base_url
                .join("/api/v1/relying/callback")
                .map_err(|e| ConfigError::Validation(format!("public_base_url: {e}"))),
        }
    }

    pub fn return_url_policy(&self) -> Result<ReturnUrlPolicy, ConfigError> {
        let mut policy = ReturnUrlPolicy::new(&self.allowed_return_origins)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        policy
            .allow(self.public_base_url.as_str())
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        policy
            .allow(self.relying_callback_url()?.as_str())
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(policy)
    }
}

fn finish(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<AppConfig, ConfigError> {
    let cfg = builder
        .add_source(config::Environment::default().separator("__"))
        .build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any variable matching the key path separated by double underscores (e.g.
/// `SESSION__OTP_TTL_SECONDS`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    finish(config::Config::builder().add_source(config::File::with_name(path)))
}

/// Same as [`load_config`] but from an in-memory YAML document.
pub fn load_config_str(yaml: &str) -> Result<AppConfig, ConfigError> {
    finish(
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml)),
    )
}

/// Convenience helper for binaries wanting the panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
public_base_url: "https://bank.example"
provider_entry_url: "https://provider.example/verify"
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = load_config_str(MINIMAL).unwrap();
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.session.otp_ttl_seconds, 180);
        assert_eq!(cfg.session.max_otp_attempts, 5);
        assert!(cfg.callback.accept_legacy_text);
        assert!(!cfg.demo.expose_otp);
        assert!(cfg.carriers.is_empty());
        assert_eq!(
            cfg.relying_callback_url().unwrap().as_str(),
            "https://bank.example/api/v1/relying/callback"
        );
    }

    #[test]
    fn public_origin_is_always_allowed() {
        let cfg = load_config_str(MINIMAL).unwrap();
        let policy = cfg.return_url_policy().unwrap();
        assert!(policy.validate("https://bank.example/anything").is_ok());
        assert!(policy.validate("https://other.example/").is_err());
    }

    #[test]
    fn cooldown_must_fit_inside_ttl() {
        let yaml = format!("{MINIMAL}\nsession:\n  resend_cooldown_seconds: 180\n");
        assert!(matches!(
            load_config_str(&yaml),
            Err(ConfigError::Validation(_))
        ));
    }
}

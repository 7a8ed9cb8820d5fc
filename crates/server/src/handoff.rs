//! Browser handoff URLs between the relying application and the provider.
//!
//! The entry URL carries `tokenId`, `name`, `phoneNumber` and `returnUrl`. The return
//! URL gets `tokenId`, `phoneNumber` and `name` appended. Only `tokenId` matters to the
//! receiving side; the claims on either URL are prefill and must not be trusted.

use crate::error::VerificationError;
use crate::session::{Claims, TokenId};
use std::borrow::Cow;
use std::collections::HashSet;
use url::{Origin, Url};

pub const TOKEN_ID_PARAM: &str = "tokenId";
pub const NAME_PARAM: &str = "name";
pub const PHONE_PARAM: &str = "phoneNumber";
pub const RETURN_URL_PARAM: &str = "returnUrl";
/// Older relying apps still send this instead of `returnUrl`.
pub const LEGACY_RETURN_URL_PARAM: &str = "redirectUrl";

/// Origins (scheme, host, port) a subject may be sent back to.
#[derive(Debug, Clone, Default)]
pub struct ReturnUrlPolicy {
    origins: HashSet<Origin>,
}

impl ReturnUrlPolicy {
    pub fn new<I, S>(origins: I) -> Result<Self, VerificationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = ReturnUrlPolicy::default();
        for raw in origins {
            policy.allow(raw.as_ref())?;
        }
        Ok(policy)
    }

    /// Register the origin of `raw`. Paths and queries are ignored.
    pub fn allow(&mut self, raw: &str) -> Result<(), VerificationError> {
        let url = parse_web_url(raw).map_err(|reason| {
            VerificationError::validation("allowedReturnOrigins", format!("{raw}: {reason}"))
        })?;
        self.origins.insert(url.origin());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Parse `raw` and check it points at a registered origin.
    pub fn validate(&self, raw: &str) -> Result<Url, VerificationError> {
        let url = parse_web_url(raw).map_err(VerificationError::ReturnUrlRejected)?;
        if !self.origins.contains(&url.origin()) {
            return Err(VerificationError::ReturnUrlRejected(format!(
                "origin {} is not registered",
                url.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }
}

fn parse_web_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("not an absolute URL ({e})"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("scheme {other} is not allowed")),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".to_string());
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("credentials are not allowed".to_string());
    }
    Ok(url)
}

/// Display-only claims placed on the entry URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefill {
    pub name: String,
    pub phone_number: String,
}

impl From<&Claims> for Prefill {
    fn from(claims: &Claims) -> Self {
        Prefill {
            name: claims.name.clone(),
            phone_number: claims.phone.clone(),
        }
    }
}

/// Builds provider entry URLs for one provider deployment.
#[derive(Debug, Clone)]
pub struct HandoffBuilder {
    provider_entry: Url,
    return_urls: ReturnUrlPolicy,
}

impl HandoffBuilder {
    pub fn new(provider_entry: Url, return_urls: ReturnUrlPolicy) -> Self {
        Self {
            provider_entry,
            return_urls,
        }
    }

    pub fn return_urls(&self) -> &ReturnUrlPolicy {
        &self.return_urls
    }

    /// Entry URL for `token_id`. The return URL is checked against the allow-list first.
    pub fn provider_url(
        &self,
        token_id: &TokenId,
        prefill: &Prefill,
        return_url: &str,
    ) -> Result<Url, VerificationError> {
        let return_url = self.return_urls.validate(return_url)?;
        Ok(build_provider_url(
            &self.provider_entry,
            token_id,
            prefill,
            &return_url,
        ))
    }
}

/// Append the handoff parameters to `entry`, keeping whatever query it already has.
pub fn build_provider_url(
    entry: &Url,
    token_id: &TokenId,
    prefill: &Prefill,
    return_url: &Url,
) -> Url {
    let mut url = entry.clone();
    url.query_pairs_mut()
        .append_pair(TOKEN_ID_PARAM, token_id.as_str())
        .append_pair(NAME_PARAM, &prefill.name)
        .append_pair(PHONE_PARAM, &prefill.phone_number)
        .append_pair(RETURN_URL_PARAM, return_url.as_str());
    url
}

/// Decoded provider entry query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub token_id: TokenId,
    pub prefill: Prefill,
    /// Unvalidated. The provider checks it against its own allow-list.
    pub return_url: Option<String>,
}

impl ProviderEntry {
    pub fn parse(url: &Url) -> Result<Self, VerificationError> {
        Self::from_pairs(url.query_pairs())
    }

    pub fn from_query(query: &str) -> Result<Self, VerificationError> {
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    fn from_pairs<'a>(
        pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
    ) -> Result<Self, VerificationError> {
        let mut token_id = None;
        let mut name = String::new();
        let mut phone_number = String::new();
        let mut return_url = None;
        let mut legacy_return_url = None;

        for (key, value) in pairs {
            match key.as_ref() {
                TOKEN_ID_PARAM => token_id = Some(value.into_owned()),
                NAME_PARAM => name = value.into_owned(),
                PHONE_PARAM => phone_number = value.into_owned(),
                RETURN_URL_PARAM => return_url = Some(value.into_owned()),
                LEGACY_RETURN_URL_PARAM => legacy_return_url = Some(value.into_owned()),
                _ => {}
            }
        }

        let token_id = token_id
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VerificationError::validation(TOKEN_ID_PARAM, "missing"))?;

        Ok(ProviderEntry {
            token_id: TokenId::new(token_id),
            prefill: Prefill { name, phone_number },
            return_url: return_url.or(legacy_return_url).filter(|u| !u.is_empty()),
        })
    }
}

/// Return URL for a confirmed handoff. Existing `tokenId`, `phoneNumber` and `name`
/// parameters are replaced; everything else is kept in order.
pub fn build_return_url(return_url: &Url, token_id: &TokenId, phone: &str, name: &str) -> Url {
    let kept: Vec<(String, String)> = return_url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), TOKEN_ID_PARAM | PHONE_PARAM | NAME_PARAM))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = return_url.clone();
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query
            .append_pair(TOKEN_ID_PARAM, token_id.as_str())
            .append_pair(PHONE_PARAM, phone)
            .append_pair(NAME_PARAM, name);
    }
    url
}

//! Verification provider: collects supplementary attributes, drives OTP issuance and
//! confirmation against the authority, and redirects the subject back.

pub mod countdown;

use crate::client::AuthorityApi;
use crate::error::{ClientError, VerificationError};
use crate::handoff::{Prefill, ProviderEntry, ReturnUrlPolicy, build_return_url};
use crate::protocol::{ConfirmRequest, OtpIssued, OtpRequest};
use crate::session::{Carrier, TokenId, VerificationStatus, mask_phone, normalize_phone};
use crate::tokens::is_well_formed_otp;
pub use countdown::{OtpCountdown, format_remaining};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;
use utoipa::ToSchema;

/// Attributes typed into the provider form.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttributes {
    pub name: String,
    pub phone_number: String,
    /// First half of the resident registration number, `YYMMDD`.
    pub resident_front: String,
    pub carrier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAttributes {
    pub name: String,
    pub phone: String,
    pub resident_front: String,
    pub carrier: Carrier,
}

impl SubjectAttributes {
    pub fn validate(&self) -> Result<ValidatedAttributes, VerificationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(VerificationError::validation("name", "must not be empty"));
        }
        let phone = normalize_phone(&self.phone_number);
        if !(10..=11).contains(&phone.len()) {
            return Err(VerificationError::validation(
                "phoneNumber",
                "must have 10 or 11 digits",
            ));
        }
        let resident_front = self.resident_front.trim();
        validate_resident_front(resident_front)?;
        let carrier: Carrier = self.carrier.parse()?;
        Ok(ValidatedAttributes {
            name: name.to_string(),
            phone,
            resident_front: resident_front.to_string(),
            carrier,
        })
    }
}

fn validate_resident_front(value: &str) -> Result<(), VerificationError> {
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VerificationError::validation(
            "residentFront",
            "must be 6 digits",
        ));
    }
    // all ASCII digits, so byte slicing is safe
    let month: u8 = value[2..4].parse().unwrap_or(0);
    let day: u8 = value[4..6].parse().unwrap_or(0);
    if !(1..=12).contains(&month) {
        return Err(VerificationError::validation(
            "residentFront",
            "month must be 01-12",
        ));
    }
    if !(1..=31).contains(&day) {
        return Err(VerificationError::validation(
            "residentFront",
            "day must be 01-31",
        ));
    }
    Ok(())
}

/// Subscriber records of the mobile carriers.
pub trait CarrierDirectory: Send + Sync {
    /// Whether the directory backs the `(phone, name, carrier)` triple.
    fn confirms(&self, subject: &ValidatedAttributes) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CarrierRecord {
    pub phone_number: String,
    pub name: String,
    pub carrier: Carrier,
}

/// In-memory directory. An empty directory confirms everyone.
#[derive(Debug, Clone, Default)]
pub struct StaticCarrierDirectory {
    by_phone: HashMap<String, (String, Carrier)>,
}

impl StaticCarrierDirectory {
    pub fn new(records: impl IntoIterator<Item = CarrierRecord>) -> Self {
        let by_phone = records
            .into_iter()
            .map(|r| (normalize_phone(&r.phone_number), (r.name, r.carrier)))
            .collect();
        Self { by_phone }
    }

    pub fn is_empty(&self) -> bool {
        self.by_phone.is_empty()
    }
}

impl CarrierDirectory for StaticCarrierDirectory {
    fn confirms(&self, subject: &ValidatedAttributes) -> bool {
        if self.by_phone.is_empty() {
            return true;
        }
        self.by_phone
            .get(&subject.phone)
            .is_some_and(|(name, carrier)| *name == subject.name && *carrier == subject.carrier)
    }
}

/// Provider side service. Handlers use it statelessly; [`ProviderFlow`] wraps it for
/// one browser tab.
pub struct Provider<A, D = StaticCarrierDirectory> {
    authority: A,
    directory: D,
    return_urls: ReturnUrlPolicy,
}

impl<A: AuthorityApi, D: CarrierDirectory> Provider<A, D> {
    pub fn new(authority: A, directory: D, return_urls: ReturnUrlPolicy) -> Self {
        Self {
            authority,
            directory,
            return_urls,
        }
    }

    /// Start a tab from the entry URL. The return URL is checked before anything else.
    pub fn open(
        &self,
        entry: ProviderEntry,
    ) -> Result<ProviderFlow<'_, A, D>, VerificationError> {
        let return_url = self.check_return_url(entry.return_url.as_deref())?;
        Ok(ProviderFlow {
            provider: self,
            token_id: entry.token_id,
            prefill: entry.prefill,
            return_url,
            subject: None,
            countdown: None,
        })
    }

    pub fn check_return_url(&self, raw: Option<&str>) -> Result<Url, VerificationError> {
        let raw = raw
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| VerificationError::validation("returnUrl", "missing"))?;
        self.return_urls.validate(raw)
    }

    /// Validate the form and ask the authority for a code.
    #[tracing::instrument(skip_all, fields(token_id = %token_id))]
    pub async fn request_otp(
        &self,
        token_id: &TokenId,
        attributes: &SubjectAttributes,
    ) -> Result<(ValidatedAttributes, OtpIssued), ClientError> {
        let subject = attributes.validate()?;
        if !self.directory.confirms(&subject) {
            tracing::info!(
                phone = %mask_phone(&subject.phone),
                carrier = subject.carrier.as_str(),
                "carrier directory mismatch"
            );
            return Err(VerificationError::ClaimMismatch.into());
        }
        let issued = self
            .authority
            .request_otp(OtpRequest {
                token_id: token_id.clone(),
                name: subject.name.clone(),
                phone_number: subject.phone.clone(),
            })
            .await?;
        Ok((subject, issued))
    }

    /// Confirm the code and build the redirect back to the relying application.
    ///
    /// The redirect goes to the return URL the session was opened with. A browser
    /// submitting any other URL is refused before the code is spent.
    #[tracing::instrument(skip_all, fields(token_id = %token_id))]
    pub async fn confirm(
        &self,
        token_id: &TokenId,
        otp: &str,
        return_url: &str,
    ) -> Result<Url, ClientError> {
        let otp = otp.trim();
        if !is_well_formed_otp(otp) {
            return Err(VerificationError::validation("otp", "must be 6 digits").into());
        }
        let submitted = self.check_return_url(Some(return_url))?;
        let registered = self.authority.status(token_id).await?.return_url;
        let return_url = match registered {
            Some(raw) => {
                let registered = self.return_urls.validate(&raw)?;
                if registered != submitted {
                    tracing::warn!(submitted = %submitted, "return url differs from registration");
                    return Err(VerificationError::ReturnUrlRejected(
                        "does not match the registered return url".to_string(),
                    )
                    .into());
                }
                registered
            }
            None => submitted,
        };

        self.authority
            .confirm_otp(ConfirmRequest {
                token_id: token_id.clone(),
                otp: otp.to_string(),
            })
            .await?;

        let view = self.authority.status(token_id).await?;
        match (view.status, view.name, view.phone_number) {
            (VerificationStatus::Confirmed, Some(name), Some(phone)) => {
                Ok(build_return_url(&return_url, token_id, &phone, &name))
            }
            (status, ..) => Err(ClientError::MalformedUpstreamResponse(format!(
                "status after confirm is {status}"
            ))),
        }
    }
}

/// One tab's worth of provider state.
pub struct ProviderFlow<'p, A, D> {
    provider: &'p Provider<A, D>,
    token_id: TokenId,
    prefill: Prefill,
    return_url: Url,
    subject: Option<ValidatedAttributes>,
    countdown: Option<OtpCountdown>,
}

impl<A: AuthorityApi, D: CarrierDirectory> ProviderFlow<'_, A, D> {
    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn prefill(&self) -> &Prefill {
        &self.prefill
    }

    pub fn return_url(&self) -> &Url {
        &self.return_url
    }

    pub fn otp_sent(&self) -> bool {
        self.subject.is_some()
    }

    pub fn countdown(&self) -> Option<&OtpCountdown> {
        self.countdown.as_ref()
    }

    pub async fn request_otp(
        &mut self,
        attributes: &SubjectAttributes,
    ) -> Result<OtpIssued, ClientError> {
        let (subject, issued) = self.provider.request_otp(&self.token_id, attributes).await?;
        self.subject = Some(subject);
        self.restart_countdown(&issued);
        Ok(issued)
    }

    /// Ask for a fresh code with the attributes already accepted.
    pub async fn resend(&mut self) -> Result<OtpIssued, ClientError> {
        let Some(subject) = &self.subject else {
            return Err(VerificationError::NotPending(VerificationStatus::Pending).into());
        };
        let issued = self
            .provider
            .authority
            .request_otp(OtpRequest {
                token_id: self.token_id.clone(),
                name: subject.name.clone(),
                phone_number: subject.phone.clone(),
            })
            .await?;
        self.restart_countdown(&issued);
        Ok(issued)
    }

    pub async fn confirm(&mut self, otp: &str) -> Result<Url, ClientError> {
        let url = self
            .provider
            .confirm(&self.token_id, otp, self.return_url.as_str())
            .await?;
        self.countdown = None;
        Ok(url)
    }

    fn restart_countdown(&mut self, issued: &OtpIssued) {
        // replacing the old countdown drops and cancels it
        self.countdown = Some(OtpCountdown::start(
            issued.expires_in_seconds.max(0) as u64,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(resident_front: &str, carrier: &str) -> SubjectAttributes {
        SubjectAttributes {
            name: "Hong Gildong".into(),
            phone_number: "010-1234-5678".into(),
            resident_front: resident_front.into(),
            carrier: carrier.into(),
        }
    }

    fn field_of(e: VerificationError) -> String {
        match e {
            VerificationError::Validation { field, .. } => field,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resident_front_is_a_plausible_date() {
        assert!(attrs("900101", "SKT").validate().is_ok());
        assert!(attrs("001231", "KT").validate().is_ok());
        for bad in ["90010", "9001011", "9a0101", "901301", "900100", "900132", "900001"] {
            let err = attrs(bad, "SKT").validate().unwrap_err();
            assert_eq!(field_of(err), "residentFront", "{bad}");
        }
    }

    #[test]
    fn carrier_must_be_known() {
        let ok = attrs("900101", "LGU+").validate().unwrap();
        assert_eq!(ok.carrier, Carrier::LguPlus);
        assert_eq!(ok.phone, "01012345678");
        assert_eq!(
            field_of(attrs("900101", "lgu").validate().unwrap_err()),
            "carrier"
        );
    }

    #[test]
    fn directory_checks_the_whole_triple() {
        let directory = StaticCarrierDirectory::new([CarrierRecord {
            phone_number: "01012345678".into(),
            name: "Hong Gildong".into(),
            carrier: Carrier::Skt,
        }]);
        assert!(directory.confirms(&attrs("900101", "SKT").validate().unwrap()));
        assert!(!directory.confirms(&attrs("900101", "KT").validate().unwrap()));

        let mut stranger = attrs("900101", "SKT");
        stranger.phone_number = "01099998888".into();
        assert!(!directory.confirms(&stranger.validate().unwrap()));

        assert!(StaticCarrierDirectory::default().confirms(&stranger.validate().unwrap()));
    }
}

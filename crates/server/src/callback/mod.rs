//! Relying-side half of the handoff: start a verification for a business flow and
//! settle the browser's return.
//!
//! The return URL is untrusted. Its `tokenId` only says which session to ask about;
//! the outcome always comes from a fresh `status` query against the authority.

pub mod response;

use crate::client::AuthorityApi;
use crate::error::{ClientError, VerificationError};
use crate::handoff::{HandoffBuilder, Prefill};
use crate::protocol::InitRequest;
use crate::session::{TokenId, VerificationStatus, normalize_phone};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;
use url::form_urlencoded::byte_serialize;
use utoipa::{IntoParams, ToSchema};

/// Business flow waiting on a verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusinessFlow {
    Registration,
    LoginRecovery { username: String },
    AccountCreation { username: String },
    Consent { campaign: String },
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

impl BusinessFlow {
    pub fn kind(&self) -> &'static str {
        match self {
            BusinessFlow::Registration => "registration",
            BusinessFlow::LoginRecovery { .. } => "loginRecovery",
            BusinessFlow::AccountCreation { .. } => "accountCreation",
            BusinessFlow::Consent { .. } => "consent",
        }
    }

    /// Where the subject starts over.
    pub fn entry_path(&self) -> String {
        match self {
            BusinessFlow::Registration => "/register".to_string(),
            BusinessFlow::LoginRecovery { .. } => "/login/recover".to_string(),
            BusinessFlow::AccountCreation { .. } => "/accounts/new".to_string(),
            BusinessFlow::Consent { campaign } => format!("/consent/{}", encode(campaign)),
        }
    }

    /// Where the subject continues after a confirmed verification.
    pub fn resume_path(&self) -> String {
        match self {
            BusinessFlow::Registration => "/register?verified=true".to_string(),
            BusinessFlow::LoginRecovery { username } => {
                format!("/login/recover/reset?username={}", encode(username))
            }
            BusinessFlow::AccountCreation { username } => {
                format!("/accounts/new/complete?username={}", encode(username))
            }
            BusinessFlow::Consent { campaign } => {
                format!("/consent/{}/complete", encode(campaign))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFlow {
    pub flow: BusinessFlow,
    pub token_id: TokenId,
}

/// Single-use records of which flow started which verification, keyed by browser context.
#[derive(Debug, Default)]
pub struct FlowMarkers {
    markers: DashMap<String, PendingFlow>,
}

impl FlowMarkers {
    /// Store a marker. A newer verification in the same context replaces the older one.
    pub fn begin(&self, context_id: &str, pending: PendingFlow) {
        if let Some(previous) = self.markers.insert(context_id.to_string(), pending) {
            tracing::debug!(token_id = %previous.token_id, "replaced pending flow marker");
        }
    }

    /// Remove and return the marker.
    pub fn take(&self, context_id: &str) -> Option<PendingFlow> {
        self.markers.remove(context_id).map(|(_, pending)| pending)
    }

    /// Put a taken marker back, unless a newer one arrived meanwhile.
    pub fn rearm(&self, context_id: &str, pending: PendingFlow) {
        self.markers.entry(context_id.to_string()).or_insert(pending);
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Query the browser brings back. Everything except `tokenId` is advisory.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    pub token_id: Option<String>,
    pub name: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSubject {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    MissingToken,
    NoPendingFlow,
    TokenMismatch,
    NotConfirmed,
    Expired,
    Failed,
    NotFound,
    Unreadable,
    Unavailable,
}

impl RestartReason {
    pub fn user_message(self) -> &'static str {
        match self {
            RestartReason::MissingToken | RestartReason::NoPendingFlow => {
                "This verification link is not valid. Please start again."
            }
            RestartReason::TokenMismatch => {
                "This verification belongs to a different request. Please start again."
            }
            RestartReason::NotConfirmed => "Verification was not completed. Please try again.",
            RestartReason::Expired => "Verification timed out. Please start again.",
            RestartReason::Failed => "The information did not match. Please try again.",
            RestartReason::NotFound => "Verification session not found. Please start again.",
            RestartReason::Unreadable => {
                "The verification result could not be read. Please start again."
            }
            RestartReason::Unavailable => {
                "The verification service could not be reached. Please retry."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Resume {
        flow: BusinessFlow,
        subject: VerifiedSubject,
    },
    Restart {
        flow: Option<BusinessFlow>,
        reason: RestartReason,
    },
    /// The authority could not be reached. The marker is back in place.
    Unavailable { flow: BusinessFlow },
}

/// Claims the relying application collected before handing off.
#[derive(Debug, Clone)]
pub struct SubjectClaims {
    pub name: String,
    pub phone_number: String,
    pub carrier: Option<String>,
}

pub struct CallbackResolver<A> {
    authority: A,
    handoff: HandoffBuilder,
    markers: FlowMarkers,
}

impl<A: AuthorityApi> CallbackResolver<A> {
    pub fn new(authority: A, handoff: HandoffBuilder) -> Self {
        Self {
            authority,
            handoff,
            markers: FlowMarkers::default(),
        }
    }

    pub fn markers(&self) -> &FlowMarkers {
        &self.markers
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    /// Open a session for `flow` and return the provider URL to send the browser to.
    #[tracing::instrument(skip_all, fields(flow = flow.kind()))]
    pub async fn begin(
        &self,
        context_id: &str,
        flow: BusinessFlow,
        claims: SubjectClaims,
        callback_base: &Url,
    ) -> Result<Url, ClientError> {
        let mut return_url = callback_base.clone();
        return_url.query_pairs_mut().append_pair("flow", flow.kind());
        // Refuse before a session exists for a URL the provider would refuse anyway.
        self.handoff.return_urls().validate(return_url.as_str())?;

        let token_id = self
            .authority
            .init(InitRequest {
                name: claims.name.clone(),
                phone_number: claims.phone_number.clone(),
                carrier: claims.carrier,
                auth_request_id: Some(context_id.to_string()),
                return_url: Some(return_url.to_string()),
            })
            .await?;

        let prefill = Prefill {
            name: claims.name.trim().to_string(),
            phone_number: normalize_phone(&claims.phone_number),
        };
        let provider_url = self
            .handoff
            .provider_url(&token_id, &prefill, return_url.as_str())?;

        self.markers.begin(
            context_id,
            PendingFlow {
                flow,
                token_id: token_id.clone(),
            },
        );
        tracing::info!(token_id = %token_id, "verification handed off");
        Ok(provider_url)
    }

    /// Settle a browser return for `context_id`.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(
        &self,
        context_id: Option<&str>,
        params: &CallbackParams,
    ) -> CallbackOutcome {
        let pending = context_id.and_then(|ctx| self.markers.take(ctx));
        let token = params
            .token_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let Some(token) = token else {
            return CallbackOutcome::Restart {
                flow: pending.map(|p| p.flow),
                reason: RestartReason::MissingToken,
            };
        };
        let Some(pending) = pending else {
            tracing::warn!(token_id = token, "callback without a pending flow");
            return CallbackOutcome::Restart {
                flow: None,
                reason: RestartReason::NoPendingFlow,
            };
        };
        if pending.token_id.as_str() != token {
            tracing::warn!(
                expected = %pending.token_id,
                got = token,
                "callback token does not belong to the pending flow"
            );
            return CallbackOutcome::Restart {
                flow: Some(pending.flow),
                reason: RestartReason::TokenMismatch,
            };
        }

        let view = match self.authority.status(&pending.token_id).await {
            Ok(view) => view,
            Err(ClientError::Transport(detail)) => {
                tracing::warn!(token_id = %pending.token_id, %detail, "status query failed, marker re-armed");
                let flow = pending.flow.clone();
                if let Some(ctx) = context_id {
                    self.markers.rearm(ctx, pending);
                }
                return CallbackOutcome::Unavailable { flow };
            }
            Err(ClientError::Rejected(VerificationError::NotFound)) => {
                return CallbackOutcome::Restart {
                    flow: Some(pending.flow),
                    reason: RestartReason::NotFound,
                };
            }
            Err(e) => {
                tracing::error!(token_id = %pending.token_id, error = %e, "status query rejected");
                return CallbackOutcome::Restart {
                    flow: Some(pending.flow),
                    reason: RestartReason::Unreadable,
                };
            }
        };

        let reason = match view.status {
            VerificationStatus::Confirmed => {
                let (Some(name), Some(phone)) = (view.name, view.phone_number) else {
                    tracing::error!(token_id = %pending.token_id, "confirmed status without claims");
                    return CallbackOutcome::Restart {
                        flow: Some(pending.flow),
                        reason: RestartReason::Unreadable,
                    };
                };
                warn_on_advisory_mismatch(&pending.token_id, params, &name, &phone);
                tracing::info!(token_id = %pending.token_id, flow = pending.flow.kind(), "flow resumed");
                return CallbackOutcome::Resume {
                    flow: pending.flow,
                    subject: VerifiedSubject { name, phone },
                };
            }
            VerificationStatus::Expired => RestartReason::Expired,
            VerificationStatus::Failed => RestartReason::Failed,
            VerificationStatus::Pending | VerificationStatus::OtpSent => {
                RestartReason::NotConfirmed
            }
        };
        tracing::info!(token_id = %pending.token_id, status = %view.status, "flow restarted");
        CallbackOutcome::Restart {
            flow: Some(pending.flow),
            reason,
        }
    }
}

fn warn_on_advisory_mismatch(token_id: &TokenId, params: &CallbackParams, name: &str, phone: &str) {
    let name_differs = params
        .name
        .as_deref()
        .is_some_and(|n| !n.trim().is_empty() && n.trim() != name);
    let phone_differs = params
        .phone_number
        .as_deref()
        .map(normalize_phone)
        .is_some_and(|p| !p.is_empty() && p != phone);
    if name_differs || phone_differs {
        tracing::warn!(
            token_id = %token_id,
            name_differs,
            phone_differs,
            "return URL claims differ from the authority, using the authority"
        );
    }
}

//! Token authority: the only writer of verification session state.
//!
//! ## Operations
//!
//! - `init` - open a PENDING session for a set of claims
//! - `request_otp` - bind a fresh one-time code (also used to resend)
//! - `confirm_otp` - compare a submitted code and settle the session
//! - `status` - side-effect free read, the only outcome a relying party may trust
//!
//! Mutations on one token are serialized by a per-token async mutex. Reads go straight
//! to the repository. Expiry is derived from `otp_issued_at` and the server clock only.

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::{StoreError, VerificationError};
use crate::handoff::ReturnUrlPolicy;
use crate::logging::WideEvent;
use crate::protocol::{OtpIssued, StatusView};
use crate::session::{
    Claims, FailureReason, TokenId, VerificationSession, VerificationStatus, mask_phone,
};
use crate::store::{Repository, SweepPolicy, SweepReport};
use crate::tokens::{generate_otp, generate_token_id};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Attempts at generating a fresh token id before giving up.
const MAX_ID_ATTEMPTS: usize = 4;

/// Delivery channel for issued codes. Delivery itself is outside the authority.
pub trait OtpSender: Send + Sync {
    fn deliver(&self, session: &VerificationSession, code: &str);
}

/// Sender that only records that a code went out. The code is never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOtpSender;

impl OtpSender for LogOtpSender {
    fn deliver(&self, session: &VerificationSession, _code: &str) {
        tracing::info!(
            token_id = %session.token_id,
            phone = %mask_phone(&session.claims.phone),
            carrier = session.claims.carrier.map(|c| c.as_str()).unwrap_or("-"),
            "one-time code issued"
        );
    }
}

/// Windows and limits applied by the authority.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub otp_ttl_seconds: i64,
    pub pending_ttl_seconds: i64,
    pub max_otp_attempts: u32,
    pub resend_cooldown_seconds: i64,
    pub retention_seconds: i64,
    /// Echo issued codes back to the caller. Demo deployments only.
    pub expose_otp: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        SessionPolicy::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(c: &SessionConfig) -> Self {
        Self {
            otp_ttl_seconds: c.otp_ttl_seconds,
            pending_ttl_seconds: c.pending_ttl_seconds,
            max_otp_attempts: c.max_otp_attempts,
            resend_cooldown_seconds: c.resend_cooldown_seconds,
            retention_seconds: c.retention_seconds,
            expose_otp: false,
        }
    }
}

impl SessionPolicy {
    fn sweep(&self) -> SweepPolicy {
        SweepPolicy {
            pending_ttl_seconds: self.pending_ttl_seconds,
            retention_seconds: self.retention_seconds,
        }
    }
}

pub struct TokenAuthority<R: Repository> {
    repo: R,
    locks: DashMap<TokenId, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn OtpSender>,
    return_urls: ReturnUrlPolicy,
    policy: SessionPolicy,
}

impl<R: Repository> TokenAuthority<R> {
    pub fn new(repo: R, policy: SessionPolicy, return_urls: ReturnUrlPolicy) -> Self {
        Self {
            repo,
            locks: DashMap::new(),
            clock: Arc::new(SystemClock),
            sender: Arc::new(LogOtpSender),
            return_urls,
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn OtpSender>) -> Self {
        self.sender = sender;
        self
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn return_urls(&self) -> &ReturnUrlPolicy {
        &self.return_urls
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Open a new session. Only the token id leaves the authority.
    pub async fn init(
        &self,
        claims: Claims,
        return_url: Option<&str>,
    ) -> Result<TokenId, VerificationError> {
        let evt = WideEvent::new("init");
        evt.phone(&mask_phone(&claims.phone));

        let return_url = match return_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(raw) => match self.return_urls.validate(raw) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    evt.outcome("rejected");
                    evt.error(&e);
                    evt.warn("init rejected return url");
                    return Err(e);
                }
            },
            None => None,
        };

        let now = self.clock.now();
        for _ in 0..MAX_ID_ATTEMPTS {
            let token_id = generate_token_id()?;
            let session = VerificationSession::new(
                token_id.clone(),
                claims.clone(),
                return_url.clone(),
                self.policy.otp_ttl_seconds,
                now,
            );
            match self.repo.insert(session).await {
                Ok(()) => {
                    evt.token(&token_id);
                    evt.status(VerificationStatus::Pending);
                    evt.outcome("created");
                    evt.info("verification session opened");
                    return Ok(token_id);
                }
                Err(StoreError::Collision(id)) => {
                    tracing::warn!(token_id = %id, "token id collision, regenerating");
                }
                Err(e) => {
                    evt.outcome("store_error");
                    evt.error(&e);
                    evt.error_event("could not store session");
                    return Err(e.into());
                }
            }
        }
        evt.outcome("collision");
        evt.error_event("exhausted token id attempts");
        Err(VerificationError::RandomUnavailable)
    }

    /// Issue (or re-issue) a one-time code after checking the submitted claims.
    pub async fn request_otp(
        &self,
        token_id: &TokenId,
        name: &str,
        phone: &str,
    ) -> Result<OtpIssued, VerificationError> {
        let evt = WideEvent::new("request_otp");
        evt.token(token_id);
        let result = self
            .with_token_lock(token_id, self.request_otp_locked(token_id, name, phone))
            .await;
        report(&evt, &result, "otp_issued");
        result
    }

    async fn request_otp_locked(
        &self,
        token_id: &TokenId,
        name: &str,
        phone: &str,
    ) -> Result<OtpIssued, VerificationError> {
        let mut session = self
            .repo
            .get(token_id)
            .await?
            .ok_or(VerificationError::NotFound)?;
        let now = self.clock.now();

        match session.effective_status(now, self.policy.pending_ttl_seconds) {
            VerificationStatus::Expired if !session.status.is_terminal() => {
                session.resolve(VerificationStatus::Expired, now);
                self.repo.put(session).await?;
                return Err(VerificationError::Expired);
            }
            VerificationStatus::Expired => return Err(VerificationError::Expired),
            status if status.is_terminal() => return Err(VerificationError::NotPending(status)),
            _ => {}
        }

        if !session.claims.matches(name, phone) {
            if session.status == VerificationStatus::Pending {
                session.fail(FailureReason::ClaimMismatch, now);
                self.repo.put(session).await?;
            }
            return Err(VerificationError::ClaimMismatch);
        }

        if let Some(issued) = session.otp_issued_at {
            let elapsed = (now - issued).whole_seconds();
            if elapsed < self.policy.resend_cooldown_seconds {
                return Err(VerificationError::ResendTooSoon {
                    retry_after_seconds: self.policy.resend_cooldown_seconds - elapsed,
                });
            }
        }

        let code = generate_otp()?;
        session.status = VerificationStatus::OtpSent;
        session.otp_code = Some(code.clone());
        session.otp_issued_at = Some(now);
        session.failed_attempts = 0;
        self.repo.put(session.clone()).await?;
        self.sender.deliver(&session, &code);

        Ok(OtpIssued {
            token_id: token_id.clone(),
            expires_in_seconds: session.ttl_seconds,
            resend_after_seconds: self.policy.resend_cooldown_seconds,
            otp: self.policy.expose_otp.then_some(code),
        })
    }

    /// Settle a session by comparing the submitted code.
    pub async fn confirm_otp(
        &self,
        token_id: &TokenId,
        submitted: &str,
    ) -> Result<(), VerificationError> {
        let evt = WideEvent::new("confirm_otp");
        evt.token(token_id);
        let result = self
            .with_token_lock(token_id, self.confirm_otp_locked(token_id, submitted))
            .await;
        report(&evt, &result, "confirmed");
        result
    }

    async fn confirm_otp_locked(
        &self,
        token_id: &TokenId,
        submitted: &str,
    ) -> Result<(), VerificationError> {
        let mut session = self
            .repo
            .get(token_id)
            .await?
            .ok_or(VerificationError::NotFound)?;
        let now = self.clock.now();

        match session.status {
            VerificationStatus::OtpSent => {}
            VerificationStatus::Expired => return Err(VerificationError::Expired),
            VerificationStatus::Pending
                if session.effective_status(now, self.policy.pending_ttl_seconds)
                    == VerificationStatus::Expired =>
            {
                session.resolve(VerificationStatus::Expired, now);
                self.repo.put(session).await?;
                return Err(VerificationError::Expired);
            }
            other => return Err(VerificationError::NotPending(other)),
        }

        if session.otp_expired(now) {
            session.resolve(VerificationStatus::Expired, now);
            self.repo.put(session).await?;
            return Err(VerificationError::Expired);
        }

        let matches = session
            .otp_code
            .as_deref()
            .is_some_and(|code| code == submitted.trim());
        if matches {
            session.resolve(VerificationStatus::Confirmed, now);
            self.repo.put(session).await?;
            return Ok(());
        }

        session.failed_attempts += 1;
        if session.failed_attempts >= self.policy.max_otp_attempts {
            session.fail(FailureReason::AttemptsExhausted, now);
            self.repo.put(session).await?;
            return Err(VerificationError::AttemptsExhausted);
        }
        let attempts_remaining = self.policy.max_otp_attempts - session.failed_attempts;
        self.repo.put(session).await?;
        Err(VerificationError::OtpMismatch { attempts_remaining })
    }

    /// Current status of a session. Never writes.
    pub async fn status(&self, token_id: &TokenId) -> Result<StatusView, VerificationError> {
        let session = self
            .repo
            .get(token_id)
            .await?
            .ok_or(VerificationError::NotFound)?;
        let status = session.effective_status(self.clock.now(), self.policy.pending_ttl_seconds);
        tracing::debug!(token_id = %token_id, status = %status, "status query");
        Ok(StatusView {
            token_id: session.token_id,
            status,
            name: Some(session.claims.name),
            phone_number: (status == VerificationStatus::Confirmed).then_some(session.claims.phone),
            return_url: session.return_url,
        })
    }

    /// Expire lapsed sessions and purge settled ones past the retention window.
    ///
    /// Each candidate is re-read and settled under its token lock, so a sweep never
    /// races a request or confirm on the same token.
    pub async fn sweep(&self) -> Result<SweepReport, VerificationError> {
        let now = self.clock.now();
        let candidates = self.repo.sweep_expired(now, self.policy.sweep()).await?;

        let mut report = SweepReport::default();
        for id in candidates.expired.iter().chain(&candidates.purged) {
            match self.with_token_lock(id, self.sweep_one_locked(id)).await {
                Ok(Some(Swept::Expired)) => report.expired.push(id.clone()),
                Ok(Some(Swept::Purged)) => {
                    self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
                    report.purged.push(id.clone());
                }
                Ok(None) | Err(VerificationError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        if !report.expired.is_empty() || !report.purged.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                purged = report.purged.len(),
                "session sweep"
            );
        }
        Ok(report)
    }

    async fn sweep_one_locked(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<Swept>, VerificationError> {
        let mut session = self
            .repo
            .get(token_id)
            .await?
            .ok_or(VerificationError::NotFound)?;
        // the clock may have moved while waiting for the lock
        let now = self.clock.now();
        let policy = self.policy.sweep();
        if policy.expires(&session, now) {
            session.resolve(VerificationStatus::Expired, now);
            self.repo.put(session).await?;
            Ok(Some(Swept::Expired))
        } else if policy.purges(&session, now) {
            self.repo.delete(token_id).await?;
            Ok(Some(Swept::Purged))
        } else {
            Ok(None)
        }
    }

    async fn with_token_lock<T>(
        &self,
        token_id: &TokenId,
        op: impl Future<Output = Result<T, VerificationError>>,
    ) -> Result<T, VerificationError> {
        let lock = self.locks.entry(token_id.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);
        if matches!(result, Err(VerificationError::NotFound)) {
            // Do not let probes for unknown tokens grow the lock table.
            self.locks
                .remove_if(token_id, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }
}

enum Swept {
    Expired,
    Purged,
}

/// Periodically expire and purge sessions until the returned handle is aborted.
pub fn spawn_sweep_task<R: Repository>(
    authority: Arc<TokenAuthority<R>>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = authority.sweep().await {
                tracing::error!(error = %e, "session sweep failed");
            }
        }
    })
}

fn report<T>(evt: &WideEvent, result: &Result<T, VerificationError>, success: &str) {
    match result {
        Ok(_) => {
            evt.outcome(success);
            evt.info("authority operation succeeded");
        }
        Err(e) if e.is_internal() => {
            evt.outcome(e.code());
            evt.error(e);
            evt.error_event("authority operation failed");
        }
        Err(e) => {
            evt.outcome(e.code());
            if let VerificationError::OtpMismatch { attempts_remaining } = e {
                evt.attempts(*attempts_remaining);
            }
            evt.info("authority operation rejected");
        }
    }
}

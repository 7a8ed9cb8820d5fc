//! Token authority behaviour tests.
//!
//! All time-dependent cases run against a [`ManualClock`] so window boundaries are exact.

use phone_handoff::Authority;
use phone_handoff::authority::{OtpSender, SessionPolicy, TokenAuthority};
use phone_handoff::clock::ManualClock;
use phone_handoff::error::{StoreError, VerificationError};
use phone_handoff::handoff::ReturnUrlPolicy;
use phone_handoff::session::{Claims, TokenId, VerificationSession, VerificationStatus};
use phone_handoff::store::{MemoryRepository, Repository, SweepPolicy, SweepReport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::Notify;

const NAME: &str = "Hong Gildong";
const PHONE: &str = "01012345678";

#[derive(Default)]
struct RecordingSender {
    codes: Mutex<Vec<(TokenId, String)>>,
}

impl OtpSender for RecordingSender {
    fn deliver(&self, session: &VerificationSession, code: &str) {
        self.codes
            .lock()
            .unwrap()
            .push((session.token_id.clone(), code.to_string()));
    }
}

impl RecordingSender {
    fn last_for(&self, token_id: &TokenId) -> String {
        self.codes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == token_id)
            .map(|(_, code)| code.clone())
            .expect("a code was delivered")
    }

    fn count(&self) -> usize {
        self.codes.lock().unwrap().len()
    }
}

struct Harness {
    authority: Arc<Authority>,
    clock: ManualClock,
    sender: Arc<RecordingSender>,
}

fn harness() -> Harness {
    let clock = ManualClock::default();
    let sender = Arc::new(RecordingSender::default());
    let authority = TokenAuthority::new(
        MemoryRepository::new(),
        SessionPolicy::default(),
        ReturnUrlPolicy::new(["https://bank.example"]).unwrap(),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_sender(sender.clone());
    Harness {
        authority: Arc::new(authority),
        clock,
        sender,
    }
}

fn claims() -> Claims {
    Claims::parse(NAME, PHONE, Some("SKT"), Some("req-1")).unwrap()
}

fn wrong_code(code: &str) -> &'static str {
    if code == "000000" { "111111" } else { "000000" }
}

impl Harness {
    async fn opened_with_otp(&self) -> (TokenId, String) {
        let id = self.authority.init(claims(), None).await.unwrap();
        self.authority.request_otp(&id, NAME, PHONE).await.unwrap();
        let code = self.sender.last_for(&id);
        (id, code)
    }

    async fn status(&self, id: &TokenId) -> VerificationStatus {
        self.authority.status(id).await.unwrap().status
    }
}

// =============================================================================
// Happy path and failure scenarios
// =============================================================================

#[tokio::test]
async fn confirmed_session_discloses_claims() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;
    assert_eq!(h.status(&id).await, VerificationStatus::OtpSent);

    h.authority.confirm_otp(&id, &code).await.unwrap();

    let view = h.authority.status(&id).await.unwrap();
    assert_eq!(view.status, VerificationStatus::Confirmed);
    assert_eq!(view.name.as_deref(), Some(NAME));
    assert_eq!(view.phone_number.as_deref(), Some(PHONE));
}

#[tokio::test]
async fn phone_is_withheld_until_confirmed() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    let view = h.authority.status(&id).await.unwrap();

    assert_eq!(view.status, VerificationStatus::Pending);
    assert!(view.phone_number.is_none());
}

#[tokio::test]
async fn wrong_code_counts_down_attempts() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;

    let err = h
        .authority
        .confirm_otp(&id, wrong_code(&code))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        VerificationError::OtpMismatch {
            attempts_remaining: 4
        }
    );
    assert_eq!(h.status(&id).await, VerificationStatus::OtpSent);

    // the right code still works after a miss
    h.authority.confirm_otp(&id, &code).await.unwrap();
    assert_eq!(h.status(&id).await, VerificationStatus::Confirmed);
}

#[tokio::test]
async fn fifth_wrong_code_fails_the_session() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;
    let wrong = wrong_code(&code);

    for remaining in (1..=4).rev() {
        let err = h.authority.confirm_otp(&id, wrong).await.unwrap_err();
        assert_eq!(
            err,
            VerificationError::OtpMismatch {
                attempts_remaining: remaining
            }
        );
    }
    let err = h.authority.confirm_otp(&id, wrong).await.unwrap_err();
    assert_eq!(err, VerificationError::AttemptsExhausted);
    assert_eq!(h.status(&id).await, VerificationStatus::Failed);

    // the correct code is useless once failed
    let err = h.authority.confirm_otp(&id, &code).await.unwrap_err();
    assert_eq!(
        err,
        VerificationError::NotPending(VerificationStatus::Failed)
    );
}

#[tokio::test]
async fn claim_mismatch_from_pending_fails_the_session() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    let err = h
        .authority
        .request_otp(&id, "Kim Cheolsu", PHONE)
        .await
        .unwrap_err();

    assert_eq!(err, VerificationError::ClaimMismatch);
    assert_eq!(h.status(&id).await, VerificationStatus::Failed);
    assert_eq!(h.sender.count(), 0);
}

#[tokio::test]
async fn claim_match_ignores_phone_formatting() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    h.authority
        .request_otp(&id, " Hong Gildong ", "010-1234-5678")
        .await
        .unwrap();

    assert_eq!(h.status(&id).await, VerificationStatus::OtpSent);
}

#[tokio::test]
async fn unknown_token_is_not_found_everywhere() {
    let h = harness();
    let id = TokenId::new("does-not-exist");

    assert_eq!(
        h.authority.status(&id).await.unwrap_err(),
        VerificationError::NotFound
    );
    assert_eq!(
        h.authority.request_otp(&id, NAME, PHONE).await.unwrap_err(),
        VerificationError::NotFound
    );
    assert_eq!(
        h.authority.confirm_otp(&id, "123456").await.unwrap_err(),
        VerificationError::NotFound
    );
}

// =============================================================================
// Expiry windows
// =============================================================================

#[tokio::test]
async fn code_is_accepted_up_to_the_last_second() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;

    h.clock.advance(179);
    assert_eq!(h.status(&id).await, VerificationStatus::OtpSent);
    h.clock.advance(1);
    assert_eq!(h.status(&id).await, VerificationStatus::OtpSent);

    h.authority.confirm_otp(&id, &code).await.unwrap();
}

#[tokio::test]
async fn code_is_refused_one_second_past_the_window() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;

    h.clock.advance(181);

    assert_eq!(
        h.authority.confirm_otp(&id, &code).await.unwrap_err(),
        VerificationError::Expired
    );
    assert_eq!(h.status(&id).await, VerificationStatus::Expired);

    // the transition is persisted, not only reported
    h.clock.advance(-181);
    assert_eq!(h.status(&id).await, VerificationStatus::Expired);
}

#[tokio::test]
async fn status_reads_do_not_write() {
    let h = harness();
    let (id, _) = h.opened_with_otp().await;

    h.clock.advance(200);
    for _ in 0..3 {
        assert_eq!(h.status(&id).await, VerificationStatus::Expired);
    }

    let stored = h.authority.repository().get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, VerificationStatus::OtpSent);
    assert!(stored.resolved_at.is_none());
}

#[tokio::test]
async fn untouched_pending_session_expires() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    h.clock.advance(601);

    assert_eq!(h.status(&id).await, VerificationStatus::Expired);
    assert_eq!(
        h.authority.request_otp(&id, NAME, PHONE).await.unwrap_err(),
        VerificationError::Expired
    );
}

#[tokio::test]
async fn confirm_before_any_code_is_not_pending() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    assert_eq!(
        h.authority.confirm_otp(&id, "123456").await.unwrap_err(),
        VerificationError::NotPending(VerificationStatus::Pending)
    );
    assert_eq!(h.status(&id).await, VerificationStatus::Pending);
}

// =============================================================================
// Resend
// =============================================================================

#[tokio::test]
async fn resend_inside_cooldown_is_refused() {
    let h = harness();
    let (id, _) = h.opened_with_otp().await;

    h.clock.advance(10);

    assert_eq!(
        h.authority.request_otp(&id, NAME, PHONE).await.unwrap_err(),
        VerificationError::ResendTooSoon {
            retry_after_seconds: 20
        }
    );
    assert_eq!(h.sender.count(), 1);
}

#[tokio::test]
async fn resend_replaces_the_code_and_restarts_the_window() {
    let h = harness();
    let (id, first) = h.opened_with_otp().await;

    h.clock.advance(150);
    let issued = h.authority.request_otp(&id, NAME, PHONE).await.unwrap();
    assert_eq!(issued.expires_in_seconds, 180);
    let second = h.sender.last_for(&id);

    // 300s after the first issuance, 150s after the second
    h.clock.advance(150);
    if first != second {
        assert_eq!(
            h.authority.confirm_otp(&id, &first).await.unwrap_err(),
            VerificationError::OtpMismatch {
                attempts_remaining: 4
            }
        );
    }
    h.authority.confirm_otp(&id, &second).await.unwrap();
    assert_eq!(h.status(&id).await, VerificationStatus::Confirmed);
}

#[tokio::test]
async fn resend_resets_the_attempt_counter() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;
    for _ in 0..3 {
        h.authority
            .confirm_otp(&id, wrong_code(&code))
            .await
            .unwrap_err();
    }

    h.clock.advance(30);
    h.authority.request_otp(&id, NAME, PHONE).await.unwrap();
    let fresh = h.sender.last_for(&id);

    assert_eq!(
        h.authority
            .confirm_otp(&id, wrong_code(&fresh))
            .await
            .unwrap_err(),
        VerificationError::OtpMismatch {
            attempts_remaining: 4
        }
    );
}

// =============================================================================
// Single use and uniqueness
// =============================================================================

#[tokio::test]
async fn confirmed_session_cannot_be_reused() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;
    h.authority.confirm_otp(&id, &code).await.unwrap();

    assert_eq!(
        h.authority.confirm_otp(&id, &code).await.unwrap_err(),
        VerificationError::NotPending(VerificationStatus::Confirmed)
    );
    h.clock.advance(60);
    assert_eq!(
        h.authority.request_otp(&id, NAME, PHONE).await.unwrap_err(),
        VerificationError::NotPending(VerificationStatus::Confirmed)
    );
    assert_eq!(h.status(&id).await, VerificationStatus::Confirmed);
}

#[tokio::test]
async fn token_ids_are_unique_and_url_safe() {
    let h = harness();
    let mut seen = HashSet::new();

    for _ in 0..500 {
        let id = h.authority.init(claims(), None).await.unwrap();
        assert!(id.as_str().len() >= 43);
        assert!(
            id.as_str()
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
        assert!(seen.insert(id));
    }
    assert_eq!(h.authority.repository().len(), 500);
}

#[tokio::test]
async fn return_url_is_checked_at_init() {
    let h = harness();

    let ok = h
        .authority
        .init(claims(), Some("https://bank.example/callback?flow=registration"))
        .await
        .unwrap();
    let stored = h.authority.repository().get(&ok).await.unwrap().unwrap();
    assert_eq!(
        stored.return_url.as_deref(),
        Some("https://bank.example/callback?flow=registration")
    );

    for evil in [
        "https://bank.example.evil.example/callback",
        "javascript:alert(1)",
        "//bank.example/callback",
        "https://user:pw@bank.example/callback",
    ] {
        assert!(
            matches!(
                h.authority.init(claims(), Some(evil)).await,
                Err(VerificationError::ReturnUrlRejected(_))
            ),
            "{evil} should be rejected"
        );
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_wrong_codes_are_counted_exactly() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;
    let wrong = wrong_code(&code);

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let authority = h.authority.clone();
            let id = id.clone();
            tokio::spawn(async move { authority.confirm_otp(&id, wrong).await })
        })
        .collect();

    let mut mismatches = 0;
    let mut exhausted = 0;
    let mut settled = 0;
    for task in tasks {
        match task.await.unwrap() {
            Err(VerificationError::OtpMismatch { .. }) => mismatches += 1,
            Err(VerificationError::AttemptsExhausted) => exhausted += 1,
            Err(VerificationError::NotPending(VerificationStatus::Failed)) => settled += 1,
            other => panic!("unexpected result {other:?}"),
        }
    }

    assert_eq!(mismatches, 4);
    assert_eq!(exhausted, 1);
    assert_eq!(settled, 7);
    assert_eq!(h.status(&id).await, VerificationStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirms_settle_once() {
    let h = harness();
    let (id, code) = h.opened_with_otp().await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let authority = h.authority.clone();
            let id = id.clone();
            let code = code.clone();
            tokio::spawn(async move { authority.confirm_otp(&id, &code).await })
        })
        .collect();

    let mut confirmed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => confirmed += 1,
            Err(VerificationError::NotPending(VerificationStatus::Confirmed)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(confirmed, 1);
}

// =============================================================================
// Sweep
// =============================================================================

#[tokio::test]
async fn sweep_expires_then_purges() {
    let h = harness();
    let (lapsed, _) = h.opened_with_otp().await;
    let (live, _) = {
        h.clock.advance(100);
        h.opened_with_otp().await
    };

    // first session is past its window, second is not
    h.clock.advance(100);
    let report = h.authority.sweep().await.unwrap();
    assert_eq!(report.expired, vec![lapsed.clone()]);
    assert!(report.purged.is_empty());
    assert_eq!(h.status(&live).await, VerificationStatus::OtpSent);

    h.clock.advance(h.authority.policy().retention_seconds + 1);
    let report = h.authority.sweep().await.unwrap();
    assert!(report.purged.contains(&lapsed));
    assert_eq!(
        h.authority.status(&lapsed).await.unwrap_err(),
        VerificationError::NotFound
    );
}

/// Repository that can park the next `put` until released.
#[derive(Clone, Default)]
struct GatedRepo {
    inner: MemoryRepository,
    hold_next_put: Arc<AtomicBool>,
    put_parked: Arc<Notify>,
    release_put: Arc<Notify>,
}

impl Repository for GatedRepo {
    async fn get(&self, id: &TokenId) -> Result<Option<VerificationSession>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, session: VerificationSession) -> Result<(), StoreError> {
        self.inner.insert(session).await
    }

    async fn put(&self, session: VerificationSession) -> Result<(), StoreError> {
        if self.hold_next_put.swap(false, Ordering::SeqCst) {
            self.put_parked.notify_one();
            self.release_put.notified().await;
        }
        self.inner.put(session).await
    }

    async fn delete(&self, id: &TokenId) -> Result<Option<VerificationSession>, StoreError> {
        self.inner.delete(id).await
    }

    async fn sweep_expired(
        &self,
        now: OffsetDateTime,
        policy: SweepPolicy,
    ) -> Result<SweepReport, StoreError> {
        self.inner.sweep_expired(now, policy).await
    }
}

#[tokio::test]
async fn sweep_waits_for_an_in_flight_request() {
    let clock = ManualClock::default();
    let repo = GatedRepo::default();
    let authority = Arc::new(
        TokenAuthority::new(
            repo.clone(),
            SessionPolicy::default(),
            ReturnUrlPolicy::new(["https://bank.example"]).unwrap(),
        )
        .with_clock(Arc::new(clock.clone())),
    );
    let id = authority.init(claims(), None).await.unwrap();

    // last second of the pending window; the write is parked mid-request
    clock.advance(600);
    repo.hold_next_put.store(true, Ordering::SeqCst);
    let request = tokio::spawn({
        let authority = authority.clone();
        let id = id.clone();
        async move { authority.request_otp(&id, NAME, PHONE).await }
    });
    repo.put_parked.notified().await;

    clock.advance(1);
    let sweep = tokio::spawn({
        let authority = authority.clone();
        async move { authority.sweep().await }
    });
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    assert!(!sweep.is_finished(), "sweep must wait for the token lock");

    repo.release_put.notify_one();
    assert!(request.await.unwrap().is_ok());
    let report = sweep.await.unwrap().unwrap();

    // the sweep re-read the session after the request landed: a fresh code, not lapsed
    assert!(report.expired.is_empty());
    let stored = repo.inner.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, VerificationStatus::OtpSent);
    assert!(stored.resolved_at.is_none());
}

#[tokio::test]
async fn expired_session_stays_expired_after_a_late_request() {
    let h = harness();
    let id = h.authority.init(claims(), None).await.unwrap();

    h.clock.advance(601);
    let report = h.authority.sweep().await.unwrap();
    assert_eq!(report.expired, vec![id.clone()]);

    assert_eq!(
        h.authority.request_otp(&id, NAME, PHONE).await.unwrap_err(),
        VerificationError::Expired
    );
    assert_eq!(h.status(&id).await, VerificationStatus::Expired);
}

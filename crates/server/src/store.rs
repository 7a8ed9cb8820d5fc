//! Session storage capability.
//!
//! The token authority only talks to a [`Repository`]; it never holds the map
//! itself. [`MemoryRepository`] is the in-process implementation backed by a
//! sharded `DashMap`.

use crate::error::StoreError;
use crate::session::{TokenId, VerificationSession, VerificationStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;

/// Windows the sweep applies when deciding what has lapsed or can be purged.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub pending_ttl_seconds: i64,
    pub retention_seconds: i64,
}

impl SweepPolicy {
    /// A live session whose window has lapsed at `now`.
    pub fn expires(&self, session: &VerificationSession, now: OffsetDateTime) -> bool {
        !session.status.is_terminal()
            && session.effective_status(now, self.pending_ttl_seconds)
                == VerificationStatus::Expired
    }

    /// A settled session past its retention window at `now`.
    pub fn purges(&self, session: &VerificationSession, now: OffsetDateTime) -> bool {
        session.status.is_terminal()
            && session
                .resolved_at
                .is_some_and(|at| (now - at).whole_seconds() > self.retention_seconds)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to `Expired` by this sweep.
    pub expired: Vec<TokenId>,
    /// Terminal sessions removed after their retention window.
    pub purged: Vec<TokenId>,
}

pub trait Repository: Send + Sync + 'static {
    fn get(
        &self,
        id: &TokenId,
    ) -> impl Future<Output = Result<Option<VerificationSession>, StoreError>> + Send;

    /// Store a new session. Fails with [`StoreError::Collision`] instead of
    /// overwriting an existing one.
    fn insert(
        &self,
        session: VerificationSession,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace an existing session.
    fn put(&self, session: VerificationSession)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(
        &self,
        id: &TokenId,
    ) -> impl Future<Output = Result<Option<VerificationSession>, StoreError>> + Send;

    /// List the sessions a sweep at `now` would expire or purge. Does not write: the
    /// caller settles each one while holding that token's write lock.
    fn sweep_expired(
        &self,
        now: OffsetDateTime,
        policy: SweepPolicy,
    ) -> impl Future<Output = Result<SweepReport, StoreError>> + Send;
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    sessions: Arc<DashMap<TokenId, VerificationSession>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Repository for MemoryRepository {
    async fn get(&self, id: &TokenId) -> Result<Option<VerificationSession>, StoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, session: VerificationSession) -> Result<(), StoreError> {
        match self.sessions.entry(session.token_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Collision(session.token_id)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn put(&self, session: VerificationSession) -> Result<(), StoreError> {
        self.sessions.insert(session.token_id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &TokenId) -> Result<Option<VerificationSession>, StoreError> {
        Ok(self.sessions.remove(id).map(|(_, session)| session))
    }

    async fn sweep_expired(
        &self,
        now: OffsetDateTime,
        policy: SweepPolicy,
    ) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if policy.expires(session, now) {
                report.expired.push(session.token_id.clone());
            } else if policy.purges(session, now) {
                report.purged.push(session.token_id.clone());
            }
        }
        Ok(report)
    }
}

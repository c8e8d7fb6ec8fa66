//! Persistence for sessions, phase results and tasks
//!
//! Every write is an upsert keyed by the row's natural identity:
//! sessions by id, phases by `(session, phase)`, tasks by their derived
//! [`TaskId`]. Writing the same row twice converges to one row holding the
//! latest value.
//!
//! The per-session guard is a lease stored on the session row.
//! [`Store::try_claim`] is an atomic check-and-set; [`Store::commit_session`]
//! is the transition write that releases it and only succeeds while the
//! caller still holds the lease.

mod file;
mod memory;
mod model;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use cotflow_utils::error::StoreError;
use cotflow_utils::types::{SessionId, SessionStatus, StepName, TaskId};

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use model::{Claim, Lease, PhaseRecord, RowCounts, SessionRecord, TaskRecord};

/// Mutation applied atomically by [`Store::update_session`].
pub type SessionUpdate = Box<dyn FnOnce(&mut SessionRecord) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new session. Returns `false` if the id is already taken.
    async fn insert_session(&self, session: &SessionRecord) -> Result<bool, StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// All sessions, oldest first.
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Apply `update` to the stored session under the store's write lock.
    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Take the session lease for `holder`, setting status EXECUTING.
    async fn try_claim(
        &self,
        id: &SessionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Claim, StoreError>;

    /// Write `session` with its lease cleared, if `holder` still holds the lease.
    ///
    /// Returns `false` when the lease was lost (cancelled or taken over).
    async fn commit_session(
        &self,
        session: &SessionRecord,
        holder: &str,
    ) -> Result<bool, StoreError>;

    async fn get_phase(
        &self,
        session: &SessionId,
        phase: u32,
    ) -> Result<Option<PhaseRecord>, StoreError>;

    async fn upsert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError>;

    /// Phase rows of one session, ordered by phase number.
    async fn phases(&self, session: &SessionId) -> Result<Vec<PhaseRecord>, StoreError>;

    async fn upsert_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    async fn get_task(
        &self,
        session: &SessionId,
        id: &TaskId,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Tasks of one batch, ordered by index.
    async fn tasks_for(
        &self,
        session: &SessionId,
        phase: u32,
        step: StepName,
        round: u32,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Every task of a session, ordered by (phase, round, index).
    async fn session_tasks(&self, session: &SessionId) -> Result<Vec<TaskRecord>, StoreError>;

    async fn counts(&self) -> Result<RowCounts, StoreError>;
}

/// Check-and-set shared by the store implementations.
///
/// Mutates `record` only when the claim is granted.
pub(crate) fn apply_claim(
    record: &mut SessionRecord,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Claim {
    if matches!(
        record.status,
        SessionStatus::Completed | SessionStatus::Cancelled
    ) {
        return Claim::Closed(record.status);
    }
    if let Some(lease) = &record.lease
        && !lease.is_stale(ttl, now)
    {
        return Claim::Busy {
            holder: lease.holder.clone(),
        };
    }
    if let Some(stale) = &record.lease {
        tracing::warn!(
            session_id = %record.id,
            stale_holder = %stale.holder,
            "Taking over stale session lease"
        );
    }

    let previous_status = record.status;
    record.lease = Some(Lease {
        holder: holder.to_string(),
        acquired_at: now,
    });
    record.status = SessionStatus::Executing;
    record.updated_at = now;
    Claim::Acquired {
        session: record.clone(),
        previous_status,
    }
}

/// Whether `holder` may write the transition for `stored`.
pub(crate) fn holds_lease(stored: &SessionRecord, holder: &str) -> bool {
    stored.lease.as_ref().is_some_and(|l| l.holder == holder)
}

/// Copy of `session` as written by a commit: lease cleared, timestamp bumped.
pub(crate) fn committed(session: &SessionRecord) -> SessionRecord {
    let mut out = session.clone();
    out.lease = None;
    out.updated_at = Utc::now();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cotflow_utils::test_support::session_id;
    use serde_json::Map;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_claim_sets_executing_and_lease() {
        let mut s = SessionRecord::new(session_id("a"), Map::new());
        let claim = apply_claim(&mut s, "h1", TTL, Utc::now());
        match claim {
            Claim::Acquired {
                session,
                previous_status,
            } => {
                assert_eq!(previous_status, SessionStatus::Created);
                assert_eq!(session.status, SessionStatus::Executing);
                assert_eq!(session.lease.unwrap().holder, "h1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_second_claim_is_busy() {
        let mut s = SessionRecord::new(session_id("a"), Map::new());
        let _ = apply_claim(&mut s, "h1", TTL, Utc::now());
        let claim = apply_claim(&mut s, "h2", TTL, Utc::now());
        assert_eq!(
            claim,
            Claim::Busy {
                holder: "h1".into()
            }
        );
        assert!(holds_lease(&s, "h1"));
        assert!(!holds_lease(&s, "h2"));
    }

    #[test]
    fn test_stale_lease_is_taken_over() {
        let mut s = SessionRecord::new(session_id("a"), Map::new());
        let _ = apply_claim(&mut s, "h1", TTL, Utc::now() - ChronoDuration::seconds(600));
        let claim = apply_claim(&mut s, "h2", TTL, Utc::now());
        assert!(matches!(claim, Claim::Acquired { .. }));
        assert!(holds_lease(&s, "h2"));
    }

    #[test]
    fn test_closed_sessions_are_not_claimed() {
        let mut s = SessionRecord::new(session_id("a"), Map::new());
        s.status = SessionStatus::Cancelled;
        assert_eq!(
            apply_claim(&mut s, "h", TTL, Utc::now()),
            Claim::Closed(SessionStatus::Cancelled)
        );
        assert!(s.lease.is_none());
    }
}

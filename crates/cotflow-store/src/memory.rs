use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

use cotflow_utils::error::StoreError;
use cotflow_utils::types::{SessionId, StepName, TaskId};

use crate::{
    Claim, PhaseRecord, RowCounts, SessionRecord, SessionUpdate, Store, TaskRecord, apply_claim,
    committed, holds_lease,
};

#[derive(Default)]
struct Tables {
    sessions: BTreeMap<SessionId, SessionRecord>,
    phases: BTreeMap<(SessionId, u32), PhaseRecord>,
    tasks: BTreeMap<(SessionId, TaskId), TaskRecord>,
}

/// Process-local store. One lock covers all tables, so every operation is
/// atomic with respect to every other.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        if t.sessions.contains_key(&session.id) {
            return Ok(false);
        }
        t.sessions.insert(session.id.clone(), session.clone());
        Ok(true)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut all: Vec<_> = self.tables.read().await.sessions.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut t = self.tables.write().await;
        Ok(t.sessions.get_mut(id).map(|record| {
            update(record);
            record.updated_at = Utc::now();
            record.clone()
        }))
    }

    async fn try_claim(
        &self,
        id: &SessionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Claim, StoreError> {
        let mut t = self.tables.write().await;
        Ok(match t.sessions.get_mut(id) {
            Some(record) => apply_claim(record, holder, ttl, Utc::now()),
            None => Claim::NotFound,
        })
    }

    async fn commit_session(
        &self,
        session: &SessionRecord,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        match t.sessions.get(&session.id) {
            Some(stored) if holds_lease(stored, holder) => {
                t.sessions.insert(session.id.clone(), committed(session));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_phase(
        &self,
        session: &SessionId,
        phase: u32,
    ) -> Result<Option<PhaseRecord>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.phases.get(&(session.clone(), phase)).cloned())
    }

    async fn upsert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.phases
            .insert((record.session_id.clone(), record.phase), record.clone());
        Ok(())
    }

    async fn phases(&self, session: &SessionId) -> Result<Vec<PhaseRecord>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.phases
            .values()
            .filter(|p| &p.session_id == session)
            .cloned()
            .collect())
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.tasks
            .insert((task.session_id.clone(), task.id.clone()), task.clone());
        Ok(())
    }

    async fn get_task(
        &self,
        session: &SessionId,
        id: &TaskId,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.tasks.get(&(session.clone(), id.clone())).cloned())
    }

    async fn tasks_for(
        &self,
        session: &SessionId,
        phase: u32,
        step: StepName,
        round: u32,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let t = self.tables.read().await;
        let mut batch: Vec<_> = t
            .tasks
            .values()
            .filter(|task| task.in_batch(session, phase, step, round))
            .cloned()
            .collect();
        batch.sort_by_key(|task| task.index);
        Ok(batch)
    }

    async fn session_tasks(&self, session: &SessionId) -> Result<Vec<TaskRecord>, StoreError> {
        let t = self.tables.read().await;
        let mut tasks: Vec<_> = t
            .tasks
            .values()
            .filter(|task| &task.session_id == session)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| (task.phase, task.round, task.index));
        Ok(tasks)
    }

    async fn counts(&self) -> Result<RowCounts, StoreError> {
        let t = self.tables.read().await;
        Ok(RowCounts {
            sessions: t.sessions.len(),
            phases: t.phases.len(),
            tasks: t.tasks.len(),
        })
    }
}

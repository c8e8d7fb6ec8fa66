//! JSON-file store.
//!
//! Layout under the state directory:
//!
//! ```text
//! sessions/<session>.json
//! phases/<session>/<phase>.json
//! tasks/<session>/<task>.json
//! locks/<session>.lock
//! ```
//!
//! Every document is written with a temp-file + rename, so readers never see
//! a torn row. Session mutations run under an in-process mutex plus an
//! exclusive `fd-lock` on the session's lock file, which keeps the
//! check-and-set atomic across processes sharing one state directory.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use fd_lock::RwLock as FdLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use cotflow_utils::atomic_write::write_json_atomic;
use cotflow_utils::error::StoreError;
use cotflow_utils::types::{SessionId, StepName, TaskId};

use crate::{
    Claim, PhaseRecord, RowCounts, SessionRecord, SessionUpdate, Store, TaskRecord, apply_claim,
    committed, holds_lease,
};

pub struct JsonFileStore {
    root: Utf8PathBuf,
    session_guard: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory layout cannot be created.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["sessions", "phases", "tasks", "locks"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;
        }
        debug!(root = %root, "Opened JSON file store");
        Ok(Self {
            root,
            session_guard: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn session_path(&self, id: &SessionId) -> Utf8PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    fn phase_path(&self, session: &SessionId, phase: u32) -> Utf8PathBuf {
        self.root
            .join("phases")
            .join(session.as_str())
            .join(format!("{phase}.json"))
    }

    fn task_dir(&self, session: &SessionId) -> Utf8PathBuf {
        self.root.join("tasks").join(session.as_str())
    }

    fn task_path(&self, session: &SessionId, id: &TaskId) -> Utf8PathBuf {
        self.task_dir(session).join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &SessionId) -> Utf8PathBuf {
        self.root.join("locks").join(format!("{id}.lock"))
    }

    /// Run `f` on the stored session while holding both session locks.
    ///
    /// `f` returns the value to hand back and, if the row changed, the
    /// record to write. The file lock and the read-modify-write run on the
    /// blocking pool.
    async fn with_session<T, F>(&self, id: &SessionId, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<SessionRecord>) -> (T, Option<SessionRecord>) + Send + 'static,
    {
        let _guard = self.session_guard.lock().await;

        let lock_path = self.lock_path(id);
        let path = self.session_path(id);
        tokio::task::spawn_blocking(move || locked_update(&lock_path, &path, f))
            .await
            .map_err(|e| StoreError::Lock(format!("session lock task failed: {e}")))?
    }
}

/// Read-modify-write of one session document under its exclusive file lock.
fn locked_update<T>(
    lock_path: &Utf8Path,
    path: &Utf8Path,
    f: impl FnOnce(Option<SessionRecord>) -> (T, Option<SessionRecord>),
) -> Result<T, StoreError> {
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| io_error(lock_path, &e))?;
    let mut lock = FdLock::new(lock_file);
    let _file_guard = lock
        .write()
        .map_err(|e| StoreError::Lock(format!("{lock_path}: {e}")))?;

    let current = read_json::<SessionRecord>(path)?;
    let (out, write) = f(current);
    if let Some(record) = write {
        write_json(path, &record)?;
    }
    Ok(out)
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, &e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), StoreError> {
    write_json_atomic(path, value).map_err(|e| StoreError::Io {
        path: path.to_string(),
        reason: format!("{e:#}"),
    })
}

/// Read every `*.json` document in `dir`; a missing directory is empty.
fn read_dir_json<T: DeserializeOwned>(dir: &Utf8Path) -> Result<Vec<T>, StoreError> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir, &e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, &e))?;
        let path = entry.path();
        if path.extension() != Some("json") {
            continue;
        }
        if let Some(value) = read_json(path)? {
            out.push(value);
        }
    }
    Ok(out)
}

fn count_json(dir: &Utf8Path, recursive: bool) -> Result<usize, StoreError> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(dir, &e)),
    };
    let mut total = 0;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, &e))?;
        let path = entry.path();
        if recursive && path.is_dir() {
            total += count_json(path, false)?;
        } else if path.extension() == Some("json") {
            total += 1;
        }
    }
    Ok(total)
}

#[async_trait]
impl Store for JsonFileStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<bool, StoreError> {
        let session = session.clone();
        let id = session.id.clone();
        self.with_session(&id, move |current| match current {
            Some(_) => (false, None),
            None => (true, Some(session)),
        })
        .await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        read_json(&self.session_path(id))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut all: Vec<SessionRecord> = read_dir_json(&self.root.join("sessions"))?;
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.with_session(id, move |current| match current {
            Some(mut record) => {
                update(&mut record);
                record.updated_at = Utc::now();
                (Some(record.clone()), Some(record))
            }
            None => (None, None),
        })
        .await
    }

    async fn try_claim(
        &self,
        id: &SessionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Claim, StoreError> {
        let holder = holder.to_string();
        self.with_session(id, move |current| match current {
            Some(mut record) => {
                let claim = apply_claim(&mut record, &holder, ttl, Utc::now());
                let write = matches!(claim, Claim::Acquired { .. }).then_some(record);
                (claim, write)
            }
            None => (Claim::NotFound, None),
        })
        .await
    }

    async fn commit_session(
        &self,
        session: &SessionRecord,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let next = committed(session);
        let holder = holder.to_string();
        self.with_session(&session.id, move |current| match current {
            Some(stored) if holds_lease(&stored, &holder) => (true, Some(next)),
            _ => (false, None),
        })
        .await
    }

    async fn get_phase(
        &self,
        session: &SessionId,
        phase: u32,
    ) -> Result<Option<PhaseRecord>, StoreError> {
        read_json(&self.phase_path(session, phase))
    }

    async fn upsert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        write_json(&self.phase_path(&record.session_id, record.phase), record)
    }

    async fn phases(&self, session: &SessionId) -> Result<Vec<PhaseRecord>, StoreError> {
        let mut rows: Vec<PhaseRecord> =
            read_dir_json(&self.root.join("phases").join(session.as_str()))?;
        rows.sort_by_key(|p| p.phase);
        Ok(rows)
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        write_json(&self.task_path(&task.session_id, &task.id), task)
    }

    async fn get_task(
        &self,
        session: &SessionId,
        id: &TaskId,
    ) -> Result<Option<TaskRecord>, StoreError> {
        read_json(&self.task_path(session, id))
    }

    async fn tasks_for(
        &self,
        session: &SessionId,
        phase: u32,
        step: StepName,
        round: u32,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let mut batch: Vec<TaskRecord> = read_dir_json::<TaskRecord>(&self.task_dir(session))?
            .into_iter()
            .filter(|t| t.in_batch(session, phase, step, round))
            .collect();
        batch.sort_by_key(|t| t.index);
        Ok(batch)
    }

    async fn session_tasks(&self, session: &SessionId) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tasks: Vec<TaskRecord> = read_dir_json(&self.task_dir(session))?;
        tasks.sort_by_key(|t| (t.phase, t.round, t.index));
        Ok(tasks)
    }

    async fn counts(&self) -> Result<RowCounts, StoreError> {
        Ok(RowCounts {
            sessions: count_json(&self.root.join("sessions"), false)?,
            phases: count_json(&self.root.join("phases"), true)?,
            tasks: count_json(&self.root.join("tasks"), true)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_utils::test_support::{TempStateDir, session_id};
    use cotflow_utils::types::SessionStatus;
    use serde_json::{Map, json};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_session_round_trip_on_disk() {
        let dir = TempStateDir::new();
        let store = JsonFileStore::open(dir.path.clone()).unwrap();
        let mut config = Map::new();
        config.insert("topic".into(), json!("X"));
        let s = SessionRecord::new(session_id("disk"), config);
        assert!(store.insert_session(&s).await.unwrap());

        let reopened = JsonFileStore::open(dir.path.clone()).unwrap();
        let back = reopened.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(back, s);
        assert_eq!(reopened.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_phase_rows_are_upserted() {
        let dir = TempStateDir::new();
        let store = JsonFileStore::open(dir.path.clone()).unwrap();
        let id = session_id("p");
        let mut row = PhaseRecord::new(id.clone(), 2);
        store.upsert_phase(&row).await.unwrap();
        row.integrate_result = Some(json!({"concepts": ["X"]}));
        store.upsert_phase(&row).await.unwrap();
        store.upsert_phase(&PhaseRecord::new(id.clone(), 1)).await.unwrap();

        let rows = store.phases(&id).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.phase).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rows[1].integrate_result, Some(json!({"concepts": ["X"]})));
        assert_eq!(store.counts().await.unwrap().phases, 2);
    }

    #[tokio::test]
    async fn test_corrupt_session_file_is_reported() {
        let dir = TempStateDir::new();
        let store = JsonFileStore::open(dir.path.clone()).unwrap();
        let id = session_id("bad");
        fs::write(store.session_path(&id), "{not json").unwrap();
        let err = store.get_session(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_waiting_on_file_lock_keeps_runtime_responsive() {
        let dir = TempStateDir::new();
        let store = Arc::new(JsonFileStore::open(dir.path.clone()).unwrap());
        let id = session_id("held");
        store
            .insert_session(&SessionRecord::new(id.clone(), Map::new()))
            .await
            .unwrap();

        // Another process holding the session's file lock for a while
        let lock_path = store.lock_path(&id);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let file = fs::OpenOptions::new().write(true).open(&lock_path).unwrap();
            let mut lock = FdLock::new(file);
            let _guard = lock.write().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });
        locked_rx.recv().unwrap();

        let claim = tokio::spawn({
            let store = Arc::clone(&store);
            let id = id.clone();
            async move { store.try_claim(&id, "h", TTL).await.unwrap() }
        });
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "timer stalled behind the file lock"
        );

        assert!(matches!(claim.await.unwrap(), Claim::Acquired { .. }));
        holder.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_grant_exactly_one() {
        let dir = TempStateDir::new();
        let store = Arc::new(JsonFileStore::open(dir.path.clone()).unwrap());
        let id = session_id("race");
        store
            .insert_session(&SessionRecord::new(id.clone(), Map::new()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.try_claim(&id, &format!("h{n}"), TTL).await.unwrap()
            }));
        }
        let mut acquired = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Claim::Acquired { .. }) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
        let stored = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Executing);
    }
}

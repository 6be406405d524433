//! Filesystem session storage.
//!
//! Each session owns a directory `<root>/<id>/` holding `session.json`.
//! Every committed delta rewrites the record through a temporary file that
//! is fsynced and renamed over the old one, so a crash leaves either the old
//! or the new record on disk. Records are cached after first use; each
//! session has its own async lock so writes to one session never interleave.

use std::{
    collections::HashMap,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use relay_core::{
    Session, SessionDelta, SessionFilter, SessionId, SessionStatus, SessionStore, SessionSummary,
    StorageError, StorageStats, SweepPolicy, SweepReport, now_millis, plan_sweep,
};
use tempfile::Builder;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{applied, ensure_live};

const RECORD_FILE: &str = "session.json";

/// Minimum spacing between durable writes caused by `touch` alone.
const TOUCH_FLUSH_MS: i64 = 5_000;

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    /// `last_activity` of the record currently on disk.
    durable_activity: i64,
}

/// Filesystem-backed session store.
pub struct FileSessionStore {
    root: PathBuf,
    policy: SweepPolicy,
    slots: RwLock<HashMap<SessionId, Arc<Mutex<Slot>>>>,
}

impl FileSessionStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, policy: SweepPolicy) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Session store ready");
        Ok(Self {
            root,
            policy,
            slots: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn slot(&self, id: SessionId) -> Result<Arc<Mutex<Slot>>, StorageError> {
        if let Some(slot) = self
            .slots
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
        {
            return Ok(Arc::clone(slot));
        }
        Ok(Arc::clone(
            self.slots
                .write()
                .map_err(|e| StorageError::Internal(e.to_string()))?
                .entry(id)
                .or_default(),
        ))
    }

    fn forget(&self, id: SessionId) -> Result<(), StorageError> {
        self.slots
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id);
        Ok(())
    }

    /// Ensure the slot holds the session, reading it from disk if needed.
    async fn fill(&self, id: SessionId, slot: &mut Slot) -> Result<(), StorageError> {
        if slot.session.is_some() {
            return Ok(());
        }
        match read_record(&self.session_dir(id)).await? {
            Some(session) => {
                slot.durable_activity = session.last_activity;
                slot.session = Some(session);
                Ok(())
            }
            None => {
                self.forget(id)?;
                Err(StorageError::NotFound(id))
            }
        }
    }

    async fn write(&self, session: &Session) -> Result<(), StorageError> {
        let dir = self.session_dir(session.id);
        let contents = serde_json::to_vec(session)?;
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            atomic_write(&dir.join(RECORD_FILE), &contents)
        })
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))??;
        Ok(())
    }

    /// Current summaries of every session on disk, preferring cached state.
    async fn scan(&self) -> Result<Vec<(SessionSummary, u64)>, StorageError> {
        let root = self.root.clone();
        let on_disk = tokio::task::spawn_blocking(move || scan_root(&root))
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))??;

        let mut result = Vec::with_capacity(on_disk.len());
        for (session, bytes) in on_disk {
            let cached = self
                .slots
                .read()
                .map_err(|e| StorageError::Internal(e.to_string()))?
                .get(&session.id)
                .cloned();
            let summary = match cached {
                Some(slot) => slot
                    .lock()
                    .await
                    .session
                    .as_ref()
                    .map_or_else(|| session.summary(), Session::summary),
                None => session.summary(),
            };
            result.push((summary, bytes));
        }
        Ok(result)
    }

    /// Apply a sweep planned from `scanned`.
    ///
    /// Each planned action re-reads the session under its slot lock and is
    /// skipped when the session changed since the scan. An expiry reaches
    /// the cache only once it is on disk.
    async fn sweep_scanned(
        &self,
        scanned: &[(SessionSummary, u64)],
        now: i64,
    ) -> Result<SweepReport, StorageError> {
        let plan = plan_sweep(scanned, now, &self.policy);
        let planned: HashMap<SessionId, (&SessionSummary, u64)> =
            scanned.iter().map(|(s, b)| (s.id, (s, *b))).collect();

        let mut report = SweepReport::default();
        for id in plan.expire {
            let Some((seen, _)) = planned.get(&id) else {
                continue;
            };
            let slot = self.slot(id)?;
            let mut slot = slot.lock().await;
            match self.fill(id, &mut slot).await {
                Ok(()) => {}
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    report.errors.push(format!("{id}: {e}"));
                    continue;
                }
            }
            let Some(current) = slot.session.as_ref() else {
                continue;
            };
            if !unchanged(current, seen) {
                debug!(session_id = %id, "Session changed since scan, not expiring");
                continue;
            }
            let mut next = current.clone();
            next.status = SessionStatus::Expired;
            match self.write(&next).await {
                Ok(()) => {
                    slot.durable_activity = next.last_activity;
                    slot.session = Some(next);
                    report.expired.push(id);
                }
                Err(e) => report.errors.push(format!("{id}: {e}")),
            }
        }

        for id in plan.reclaim {
            let Some((seen, bytes)) = planned.get(&id) else {
                continue;
            };
            let slot = self.slot(id)?;
            let mut slot = slot.lock().await;
            match self.fill(id, &mut slot).await {
                Ok(()) => {}
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    report.errors.push(format!("{id}: {e}"));
                    continue;
                }
            }
            if slot
                .session
                .as_ref()
                .is_some_and(|current| !unchanged(current, seen))
            {
                debug!(session_id = %id, "Session changed since scan, not reclaiming");
                continue;
            }
            match tokio::fs::remove_dir_all(self.session_dir(id)).await {
                Ok(()) => {
                    report.freed_bytes += bytes;
                    report.reclaimed.push(id);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.errors.push(format!("{id}: {e}"));
                    continue;
                }
            }
            slot.session = None;
            self.forget(id)?;
        }

        if !report.is_empty() {
            info!(
                expired = report.expired.len(),
                reclaimed = report.reclaimed.len(),
                freed_bytes = report.freed_bytes,
                errors = report.errors.len(),
                "Session sweep"
            );
        }
        Ok(report)
    }
}

/// Whether `current` is still in the state a sweep was planned against.
fn unchanged(current: &Session, seen: &SessionSummary) -> bool {
    current.status == seen.status && current.last_activity == seen.last_activity
}

async fn read_record(dir: &Path) -> Result<Option<Session>, StorageError> {
    match tokio::fs::read(dir.join(RECORD_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "record path did not have a parent directory",
        )
    })?;

    let mut file = Builder::new().prefix(".tmp-session-").tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.metadata().ok())
                .filter(std::fs::Metadata::is_file)
                .map(|meta| meta.len())
                .sum()
        })
        .unwrap_or(0)
}

fn scan_root(root: &Path) -> io::Result<Vec<(Session, u64)>> {
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        let is_session_dir = path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| Uuid::parse_str(n).is_ok());
        if !is_session_dir {
            continue;
        }
        let record = path.join(RECORD_FILE);
        match std::fs::read(&record)
            .map_err(|e| e.to_string())
            .and_then(|b| serde_json::from_slice::<Session>(&b).map_err(|e| e.to_string()))
        {
            Ok(session) => sessions.push((session, dir_size(&path))),
            Err(e) => warn!(path = %record.display(), "Skipping unreadable session: {e}"),
        }
    }
    Ok(sessions)
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self) -> Result<Session, StorageError> {
        let session = Session::new(now_millis());
        self.write(&session).await?;

        let slot = self.slot(session.id)?;
        let mut slot = slot.lock().await;
        slot.durable_activity = session.last_activity;
        slot.session = Some(session.clone());

        debug!(session_id = %session.id, "Session record created");
        Ok(session)
    }

    async fn load(&self, id: SessionId) -> Result<Session, StorageError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        self.fill(id, &mut slot).await?;
        let session = slot.session.as_ref().ok_or(StorageError::NotFound(id))?;
        ensure_live(session, &self.policy, now_millis())?;
        Ok(session.clone())
    }

    async fn touch(&self, id: SessionId) -> Result<(), StorageError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let slot = &mut *guard;
        self.fill(id, slot).await?;
        let now = now_millis();
        let session = slot.session.as_mut().ok_or(StorageError::NotFound(id))?;
        ensure_live(session, &self.policy, now)?;
        session.last_activity = session.last_activity.max(now);

        if session.last_activity - slot.durable_activity >= TOUCH_FLUSH_MS {
            let snapshot = session.clone();
            self.write(&snapshot).await?;
            slot.durable_activity = snapshot.last_activity;
        }
        Ok(())
    }

    async fn persist(&self, id: SessionId, delta: SessionDelta) -> Result<Session, StorageError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        self.fill(id, &mut slot).await?;
        let now = now_millis();
        let current = slot.session.as_ref().ok_or(StorageError::NotFound(id))?;
        ensure_live(current, &self.policy, now)?;

        let next = applied(current, &delta, now)?;
        self.write(&next).await?;
        slot.durable_activity = next.last_activity;
        slot.session = Some(next.clone());
        Ok(next)
    }

    async fn sweep(&self, now: i64) -> Result<SweepReport, StorageError> {
        let scanned = self.scan().await?;
        self.sweep_scanned(&scanned, now).await
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        let slot = self.slot(id)?;
        let _guard = slot.lock().await;
        let result = match tokio::fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(id)),
            Err(e) => Err(e.into()),
        };
        self.forget(id)?;
        result
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, StorageError> {
        let mut result: Vec<SessionSummary> = self
            .scan()
            .await?
            .into_iter()
            .map(|(s, _)| s)
            .filter(|s| filter.matches(s))
            .collect();

        result.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        for (summary, bytes) in self.scan().await? {
            stats.record(&summary, bytes);
        }
        Ok(stats)
    }

    fn policy(&self) -> &SweepPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{DispatchState, Event, EventBody, RequestId};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    const HOUR: i64 = 3_600_000;

    fn store() -> (TempDir, FileSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("sessions"), SweepPolicy::default())
            .unwrap();
        (dir, store)
    }

    fn event(seq: u64) -> Event {
        Event {
            seq,
            request_id: Some(RequestId::from(seq)),
            body: EventBody::Result {
                value: json!({ "n": seq }),
                report_id: None,
            },
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_persisted_state_survives_reopen() {
        let (dir, store) = store();
        let session = store.create().await.unwrap();
        store
            .persist(
                session.id,
                SessionDelta::default()
                    .event(event(1))
                    .event(event(2))
                    .dispatch(RequestId::from("1"), DispatchState::Completed { seq: 1 })
                    .ack(1),
            )
            .await
            .unwrap();

        let reopened =
            FileSessionStore::open(dir.path().join("sessions"), SweepPolicy::default()).unwrap();
        let loaded = reopened.load(session.id).await.unwrap();
        assert_eq!(loaded.head(), 2);
        assert_eq!(loaded.last_acked, 1);
        assert_eq!(loaded.pending.len(), 1);
        assert_eq!(loaded.pending[0].seq, 2);
        assert_eq!(
            loaded.dispatch.get(&RequestId::from("1")),
            Some(&DispatchState::Completed { seq: 1 })
        );
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load(Uuid::new_v4()).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.touch(Uuid::new_v4()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_expires_then_reclaims() {
        let (dir, store) = store();
        let session = store.create().await.unwrap();
        let start = session.last_activity;

        let report = store.sweep(start + 9 * HOUR).await.unwrap();
        assert_eq!(report.expired, vec![session.id]);
        assert!(matches!(
            store.load(session.id).await,
            Err(StorageError::Expired(_))
        ));

        // Expiry is durable.
        let reopened =
            FileSessionStore::open(dir.path().join("sessions"), SweepPolicy::default()).unwrap();
        assert!(matches!(
            reopened.load(session.id).await,
            Err(StorageError::Expired(_))
        ));

        let report = store.sweep(start + 10 * HOUR).await.unwrap();
        assert_eq!(report.reclaimed, vec![session.id]);
        assert!(report.freed_bytes > 0);
        assert!(!store.root().join(session.id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_entries() {
        let (_dir, store) = store();
        let a = store.create().await.unwrap();
        std::fs::create_dir_all(store.root().join("not-a-session")).unwrap();
        std::fs::write(store.root().join("stray.txt"), b"x").unwrap();

        let listed = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.id);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let (_dir, store) = store();
        let session = store.create().await.unwrap();
        store.remove(session.id).await.unwrap();
        assert!(!store.root().join(session.id.to_string()).exists());
        assert!(matches!(
            store.load(session.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_skips_sessions_changed_after_scan() {
        let (_dir, store) = store();
        let session = store.create().await.unwrap();
        let start = session.last_activity;

        let scanned = store.scan().await.unwrap();
        store
            .persist(session.id, SessionDelta::default().status(SessionStatus::Idle))
            .await
            .unwrap();

        let report = store.sweep_scanned(&scanned, start + 9 * HOUR).await.unwrap();
        assert!(report.expired.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(
            store.load(session.id).await.unwrap().status,
            SessionStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_failed_expiry_write_leaves_session_live() {
        let (_dir, store) = store();
        let session = store.create().await.unwrap();
        let start = session.last_activity;

        let scanned = store.scan().await.unwrap();
        let session_dir = store.root().join(session.id.to_string());
        std::fs::remove_dir_all(&session_dir).unwrap();
        std::fs::write(&session_dir, b"in the way").unwrap();

        let report = store.sweep_scanned(&scanned, start + 9 * HOUR).await.unwrap();
        assert!(report.expired.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            store.load(session.id).await.unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_sweep_reclaims_oversized_idle_session() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SweepPolicy {
            max_session_bytes: Some(64),
            ..SweepPolicy::default()
        };
        let store = FileSessionStore::open(dir.path().join("sessions"), policy).unwrap();
        let idle = store.create().await.unwrap();
        let attached = store.create().await.unwrap();
        store
            .persist(idle.id, SessionDelta::default().status(SessionStatus::Idle))
            .await
            .unwrap();

        let report = store.sweep(now_millis()).await.unwrap();
        assert_eq!(report.reclaimed, vec![idle.id]);
        assert!(report.freed_bytes > 64);
        assert!(store.load(attached.id).await.is_ok());
        assert!(matches!(
            store.load(idle.id).await,
            Err(StorageError::NotFound(_))
        ));
    }
}

/**
 * SESSION STORE - Durable ledger of billing sessions
 *
 * ROLE :
 * Mirrors the fleet store's decisions into a persistent record of every
 * session (active, closed, paid). The fleet store decides which session is
 * active; this module only remembers what is owed.
 *
 * HOW IT WORKS :
 * - `SessionStore` trait = the query surface the fleet relies on
 * - `MemorySessionStore` = volatile ledger (tests, demo setups)
 * - `JsonSessionStore` = in-memory ledger + JSON file, written by a
 *   background flusher so callers never wait on the disk
 * - Paid sessions are immutable: any update is rejected
 */

use crate::models::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Session {0} is paid and can no longer change")]
    SessionPaid(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Query surface consumed by the fleet store.
pub trait SessionStore: Send + Sync {
    fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<(), StoreError>;

    /// Unpaid sessions of one endpoint, oldest `start_time` first.
    fn find_unpaid_sessions_by_endpoint(&self, endpoint_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Startup recovery: clears "active" flags left behind by a crash.
    /// Returns how many sessions were closed.
    fn mark_all_active_sessions_inactive(&self) -> Result<usize, StoreError>;
}

/// Partial update, `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub end_time: Option<OffsetDateTime>,
    pub accrued_minutes: Option<i64>,
    pub fee: Option<i64>,
    pub is_active: Option<bool>,
    pub is_paid: Option<bool>,
    pub payment_time: Option<OffsetDateTime>,
}

impl SessionUpdate {
    pub fn accrual(now: OffsetDateTime, accrued_minutes: i64, fee: i64) -> Self {
        Self {
            end_time: Some(now),
            accrued_minutes: Some(accrued_minutes),
            fee: Some(fee),
            ..Self::default()
        }
    }

    pub fn close(now: OffsetDateTime, accrued_minutes: i64, fee: i64) -> Self {
        Self {
            is_active: Some(false),
            ..Self::accrual(now, accrued_minutes, fee)
        }
    }

    pub fn paid(paid_at: OffsetDateTime) -> Self {
        Self {
            is_active: Some(false),
            is_paid: Some(true),
            payment_time: Some(paid_at),
            ..Self::default()
        }
    }

    fn apply_to(&self, session: &mut Session) {
        if let Some(end_time) = self.end_time {
            session.end_time = end_time;
        }
        if let Some(minutes) = self.accrued_minutes {
            session.accrued_minutes = minutes;
        }
        if let Some(fee) = self.fee {
            session.fee = fee;
        }
        if let Some(active) = self.is_active {
            session.is_active = active;
        }
        if let Some(paid) = self.is_paid {
            session.is_paid = paid;
        }
        if let Some(payment_time) = self.payment_time {
            session.payment_time = Some(payment_time);
        }
        // a paid session is never active
        if session.is_paid {
            session.is_active = false;
        }
    }
}

/// Ledger operations shared by both backends.
///
/// Paid sessions stay in `sessions` forever; lookups go through the indexes
/// so a report costs the same on day one and after a year of history.
#[derive(Debug, Default)]
struct Ledger {
    sessions: Vec<Arc<Session>>,
    by_id: HashMap<String, usize>,
    unpaid_by_endpoint: HashMap<String, Vec<usize>>,
}

impl Ledger {
    fn from_sessions(sessions: Vec<Session>) -> Self {
        let mut ledger = Self::default();
        for mut session in sessions {
            if ledger.by_id.contains_key(&session.id) {
                warn!(session = %session.id, "duplicate session in ledger, keeping the first");
                continue;
            }
            if session.is_paid {
                session.is_active = false;
            }
            ledger.insert(session);
        }
        ledger
    }

    fn insert(&mut self, session: Session) {
        let idx = self.sessions.len();
        self.by_id.insert(session.id.clone(), idx);
        if !session.is_paid {
            self.unpaid_by_endpoint
                .entry(session.endpoint_id.clone())
                .or_default()
                .push(idx);
        }
        self.sessions.push(Arc::new(session));
    }

    fn create(&mut self, session: &Session) -> Result<(), StoreError> {
        if self.by_id.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id.clone()));
        }
        self.insert(session.clone());
        Ok(())
    }

    fn update(&mut self, id: &str, update: &SessionUpdate) -> Result<(), StoreError> {
        let idx = self
            .by_id
            .get(id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let session = self
            .sessions
            .get_mut(idx)
            .map(Arc::make_mut)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if session.is_paid {
            return Err(StoreError::SessionPaid(id.to_string()));
        }
        update.apply_to(session);

        if session.is_paid {
            let endpoint_id = session.endpoint_id.clone();
            self.release_unpaid(&endpoint_id, idx);
        }
        Ok(())
    }

    fn release_unpaid(&mut self, endpoint_id: &str, idx: usize) {
        if let Some(unpaid) = self.unpaid_by_endpoint.get_mut(endpoint_id) {
            unpaid.retain(|&i| i != idx);
            if unpaid.is_empty() {
                self.unpaid_by_endpoint.remove(endpoint_id);
            }
        }
    }

    fn unpaid_for(&self, endpoint_id: &str) -> Vec<Session> {
        let mut unpaid: Vec<Session> = self
            .unpaid_by_endpoint
            .get(endpoint_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|&i| self.sessions.get(i))
                    .map(|s| Session::clone(s))
                    .collect()
            })
            .unwrap_or_default();
        unpaid.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        unpaid
    }

    /// Paid sessions are never active, so only unpaid ones are visited.
    fn deactivate_all(&mut self) -> usize {
        let mut count = 0;
        for &idx in self.unpaid_by_endpoint.values().flatten() {
            if let Some(session) = self.sessions.get_mut(idx) {
                if session.is_active {
                    Arc::make_mut(session).is_active = false;
                    count += 1;
                }
            }
        }
        count
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    ledger: Mutex<Ledger>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: Vec<Session>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::from_sessions(sessions)),
        }
    }

    /// Every session ever recorded, in insertion order.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.ledger.lock().sessions.iter().map(|s| Session::clone(s)).collect()
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.ledger.lock().create(session)
    }

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<(), StoreError> {
        self.ledger.lock().update(id, update)
    }

    fn find_unpaid_sessions_by_endpoint(&self, endpoint_id: &str) -> Result<Vec<Session>, StoreError> {
        Ok(self.ledger.lock().unpaid_for(endpoint_id))
    }

    fn mark_all_active_sessions_inactive(&self) -> Result<usize, StoreError> {
        Ok(self.ledger.lock().deactivate_all())
    }
}

/// JSON-file ledger. Mutations only touch memory and flag the store dirty;
/// `persist` writes the file.
pub struct JsonSessionStore {
    storage_path: PathBuf,
    ledger: Mutex<Ledger>,
    dirty: AtomicBool,
}

impl JsonSessionStore {
    /// Loads the ledger from disk, creating an empty file on first run.
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if !path.exists() {
            fs::write(&path, "[]")?;
        }

        let content = fs::read_to_string(&path)?;
        let sessions: Vec<Session> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };

        info!(path = %path.display(), sessions = sessions.len(), "session store opened");
        Ok(Self {
            storage_path: path,
            ledger: Mutex::new(Ledger::from_sessions(sessions)),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Writes the ledger if anything changed since the last write.
    /// Returns whether a write happened.
    pub fn persist(&self) -> Result<bool, StoreError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        // pointer copies, serialization runs after the lock is released
        let sessions = self.ledger.lock().sessions.clone();
        let result = write_atomically(&self.storage_path, &sessions);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result.map(|_| true)
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut Ledger) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let out = op(&mut self.ledger.lock())?;
        self.dirty.store(true, Ordering::Release);
        Ok(out)
    }
}

fn write_atomically(path: &Path, sessions: &[Arc<Session>]) -> Result<(), StoreError> {
    let records: Vec<&Session> = sessions.iter().map(|s| s.as_ref()).collect();
    let json = serde_json::to_vec(&records)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

impl SessionStore for JsonSessionStore {
    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.mutate(|ledger| ledger.create(session))
    }

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<(), StoreError> {
        self.mutate(|ledger| ledger.update(id, update))
    }

    fn find_unpaid_sessions_by_endpoint(&self, endpoint_id: &str) -> Result<Vec<Session>, StoreError> {
        Ok(self.ledger.lock().unpaid_for(endpoint_id))
    }

    fn mark_all_active_sessions_inactive(&self) -> Result<usize, StoreError> {
        self.mutate(|ledger| Ok(ledger.deactivate_all()))
    }
}

/// Persists the JSON ledger on a fixed interval, off the fleet lock.
pub fn spawn_flusher(store: Arc<JsonSessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !store.is_dirty() {
                continue;
            }

            let target = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || target.persist()).await {
                Ok(Ok(true)) => debug!(path = %store.path().display(), "session ledger flushed"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to flush session ledger"),
                Err(e) => warn!(error = %e, "session ledger flush task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn session(endpoint: &str, label: &str, start: OffsetDateTime) -> Session {
        Session::open(endpoint, label, start)
    }

    #[test]
    fn test_unpaid_sorted_by_start_time() {
        let store = MemorySessionStore::new();
        let late = session("PC-01", "b.exe", datetime!(2026-01-01 12:00 UTC));
        let early = session("PC-01", "a.exe", datetime!(2026-01-01 10:00 UTC));
        let other = session("PC-02", "c.exe", datetime!(2026-01-01 09:00 UTC));
        store.create_session(&late).unwrap();
        store.create_session(&early).unwrap();
        store.create_session(&other).unwrap();

        let unpaid = store.find_unpaid_sessions_by_endpoint("PC-01").unwrap();
        let labels: Vec<&str> = unpaid.iter().map(|s| s.activity_label.as_str()).collect();
        assert_eq!(labels, vec!["a.exe", "b.exe"]);
    }

    #[test]
    fn test_paid_sessions_are_immutable() {
        let store = MemorySessionStore::new();
        let s = session("PC-01", "a.exe", datetime!(2026-01-01 10:00 UTC));
        store.create_session(&s).unwrap();
        store
            .update_session(&s.id, &SessionUpdate::paid(datetime!(2026-01-01 11:00 UTC)))
            .unwrap();

        let err = store
            .update_session(&s.id, &SessionUpdate::accrual(datetime!(2026-01-01 12:00 UTC), 120, 100_000))
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionPaid(_)));
        assert!(store.find_unpaid_sessions_by_endpoint("PC-01").unwrap().is_empty());

        let stored = &store.all_sessions()[0];
        assert!(stored.is_paid);
        assert!(!stored.is_active);
        assert_eq!(stored.fee, 0);
    }

    #[test]
    fn test_paid_history_leaves_unpaid_index() {
        let store = MemorySessionStore::new();
        let start = datetime!(2026-01-01 10:00 UTC);
        for hour in 0..50i64 {
            let s = session("PC-01", "a.exe", start + time::Duration::hours(hour));
            store.create_session(&s).unwrap();
            store
                .update_session(&s.id, &SessionUpdate::paid(start + time::Duration::hours(hour + 1)))
                .unwrap();
        }
        let open = session("PC-01", "b.exe", start + time::Duration::hours(60));
        store.create_session(&open).unwrap();
        store
            .update_session(&open.id, &SessionUpdate::accrual(start + time::Duration::hours(61), 60, 50_000))
            .unwrap();

        let unpaid = store.find_unpaid_sessions_by_endpoint("PC-01").unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].id, open.id);
        assert_eq!(unpaid[0].fee, 50_000);
        assert_eq!(store.all_sessions().len(), 51);
        assert!(store.find_unpaid_sessions_by_endpoint("PC-02").unwrap().is_empty());
    }

    #[test]
    fn test_loaded_ledger_is_indexed() {
        let start = datetime!(2026-01-01 10:00 UTC);
        let mut paid = session("PC-01", "a.exe", start);
        paid.is_paid = true;
        let unpaid = session("PC-01", "b.exe", start + time::Duration::hours(1));
        let mut duplicate = unpaid.clone();
        duplicate.activity_label = "c.exe".into();

        let store = MemorySessionStore::with_sessions(vec![paid.clone(), unpaid.clone(), duplicate]);
        assert_eq!(store.all_sessions().len(), 2);
        // paid records never come back active
        assert!(!store.all_sessions()[0].is_active);

        let found = store.find_unpaid_sessions_by_endpoint("PC-01").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].activity_label, "b.exe");
        assert!(matches!(
            store.update_session(&paid.id, &SessionUpdate::default()),
            Err(StoreError::SessionPaid(_))
        ));
        assert_eq!(store.mark_all_active_sessions_inactive().unwrap(), 1);
    }

    #[test]
    fn test_update_unknown_and_duplicate() {
        let store = MemorySessionStore::new();
        let s = session("PC-01", "a.exe", datetime!(2026-01-01 10:00 UTC));
        store.create_session(&s).unwrap();

        assert!(matches!(
            store.create_session(&s),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.update_session("missing", &SessionUpdate::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_startup_recovery_closes_active() {
        let mut stale = session("PC-01", "a.exe", datetime!(2026-01-01 10:00 UTC));
        stale.fee = 4_000;
        let mut closed = session("PC-02", "b.exe", datetime!(2026-01-01 10:00 UTC));
        closed.is_active = false;
        let store = MemorySessionStore::with_sessions(vec![stale, closed]);

        assert_eq!(store.mark_all_active_sessions_inactive().unwrap(), 1);
        assert!(store.all_sessions().iter().all(|s| !s.is_active));
        // recovery does not touch billing
        assert_eq!(store.all_sessions()[0].fee, 4_000);
        assert_eq!(store.mark_all_active_sessions_inactive().unwrap(), 0);
    }

    #[test]
    fn test_json_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger").join("sessions.json");

        let store = JsonSessionStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(!store.is_dirty());

        let s = session("PC-01", "a.exe", datetime!(2026-01-01 10:00 UTC));
        store.create_session(&s).unwrap();
        store
            .update_session(&s.id, &SessionUpdate::close(datetime!(2026-01-01 10:30 UTC), 30, 25_000))
            .unwrap();
        assert!(store.is_dirty());
        assert!(store.persist().unwrap());
        assert!(!store.persist().unwrap());

        let reopened = JsonSessionStore::open(&path).unwrap();
        let unpaid = reopened.find_unpaid_sessions_by_endpoint("PC-01").unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].fee, 25_000);
        assert_eq!(unpaid[0].accrued_minutes, 30);
        assert!(!unpaid[0].is_active);
        assert_eq!(unpaid[0].end_time, datetime!(2026-01-01 10:30 UTC));
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            JsonSessionStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_failed_mutation_does_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::open(dir.path().join("sessions.json")).unwrap();
        assert!(store.update_session("missing", &SessionUpdate::default()).is_err());
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn test_flusher_writes_dirty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = Arc::new(JsonSessionStore::open(&path).unwrap());
        let handle = spawn_flusher(Arc::clone(&store), Duration::from_millis(20));

        store
            .create_session(&session("PC-07", "a.exe", datetime!(2026-01-01 10:00 UTC)))
            .unwrap();

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if fs::read_to_string(&path).unwrap().contains("PC-07") {
                flushed = true;
                break;
            }
        }
        handle.abort();
        assert!(flushed, "flusher never wrote the ledger");
    }
}

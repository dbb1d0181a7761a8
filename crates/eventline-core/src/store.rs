//! Durable event stores
//!
//! Crash-tolerant persistence for the two role-bound queues: the
//! communicator's pending queue and the broker's failed queue. Each store is
//! bound to exactly one backing file; saves are debounced so bursts of
//! mutations coalesce into a single whole-state snapshot write.
//!
//! The two roles get two distinct types, `PendingStore` and `FailedStore`,
//! sharing the generic snapshot core, so cross-role method calls do not
//! typecheck.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::errors::StoreError;
use crate::record::{ErrorDetails, FailedEvent, PendingEvent};
use crate::types::EventId;

// ----------------------------------------------------------------------------
// Snapshot I/O
// ----------------------------------------------------------------------------

/// Read a snapshot file into a keyed record map
///
/// A missing file is an empty queue, not an error.
fn read_snapshot<R: DeserializeOwned>(path: &Path) -> Result<BTreeMap<EventId, R>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(BTreeMap::new());
    }

    serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: err,
    })
}

/// Write a snapshot atomically: temp file, sync, rename
///
/// Readers only ever observe the previous snapshot or the new one, never a
/// torn write.
fn write_snapshot<R: Serialize>(
    path: &Path,
    records: &BTreeMap<EventId, R>,
) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let body = serde_json::to_vec(records).map_err(|err| StoreError::Write {
        path: path.to_path_buf(),
        source: err.into(),
    })?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).map_err(io_err)?;
    file.write_all(&body).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&temp_path, path).map_err(io_err)?;

    Ok(())
}

// ----------------------------------------------------------------------------
// Queue Store Core
// ----------------------------------------------------------------------------

/// Shared debounced-snapshot core behind both role-bound stores
///
/// Mutations update the in-memory map and (re)schedule a save; the last
/// in-memory state before the timer fires is what gets persisted. Every
/// operation takes the lock once and releases it before any await point.
#[derive(Debug)]
struct QueueStore<R> {
    path: PathBuf,
    debounce: Duration,
    records: Arc<Mutex<BTreeMap<EventId, R>>>,
    save_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<R> QueueStore<R>
where
    R: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn open(path: PathBuf, debounce: Duration) -> Result<Self, StoreError> {
        let records = read_snapshot(&path)?;
        debug!(path = %path.display(), records = records.len(), "opened queue snapshot");

        Ok(Self {
            path,
            debounce,
            records: Arc::new(Mutex::new(records)),
            save_timer: Mutex::new(None),
        })
    }

    fn get(&self, id: &EventId) -> Option<R> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn contains(&self, id: &EventId) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    fn keys(&self) -> Vec<EventId> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    fn all(&self) -> BTreeMap<EventId, R> {
        self.records.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn insert(&self, id: EventId, record: R) {
        self.records.lock().unwrap().insert(id, record);
        self.schedule_save();
    }

    fn remove(&self, id: &EventId) -> Option<R> {
        let removed = self.records.lock().unwrap().remove(id);
        if removed.is_some() {
            self.schedule_save();
        }
        removed
    }

    /// Mutate a record in place; returns false when the id is unknown
    fn mutate(&self, id: &EventId, apply: impl FnOnce(&mut R)) -> bool {
        let mutated = match self.records.lock().unwrap().get_mut(id) {
            Some(record) => {
                apply(record);
                true
            }
            None => false,
        };
        if mutated {
            self.schedule_save();
        }
        mutated
    }

    fn clear(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        let drained = records.len();
        records.clear();
        drop(records);

        if drained > 0 {
            self.schedule_save();
        }
        drained
    }

    /// (Re)arm the debounced save timer
    ///
    /// A save requested before the timer fires cancels and reschedules it, so
    /// a burst of mutations produces one disk write of the final state.
    fn schedule_save(&self) {
        let path = self.path.clone();
        let debounce = self.debounce;
        let records = Arc::clone(&self.records);

        let mut timer = self.save_timer.lock().unwrap();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let snapshot = records.lock().unwrap().clone();
            if let Err(err) = write_snapshot(&path, &snapshot) {
                error!(path = %path.display(), %err, "debounced snapshot save failed");
            }
        }));
    }

    /// Write the current state immediately, bypassing the debounce timer
    fn save_now(&self) -> Result<(), StoreError> {
        if let Some(timer) = self.save_timer.lock().unwrap().take() {
            timer.abort();
        }
        let snapshot = self.records.lock().unwrap().clone();
        write_snapshot(&self.path, &snapshot)
    }
}

// ----------------------------------------------------------------------------
// Pending Store (communicator role)
// ----------------------------------------------------------------------------

/// Communicator-side store of outbound events buffered while offline
#[derive(Debug, Clone)]
pub struct PendingStore {
    inner: Arc<QueueStore<PendingEvent>>,
}

impl PendingStore {
    /// Open the pending queue backed by `path`
    pub fn open(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            inner: Arc::new(QueueStore::open(path.into(), debounce)?),
        })
    }

    /// Buffer an event, returning the id it was recorded under
    pub fn record(&self, event: impl Into<String>, args: Vec<Value>) -> EventId {
        let id = EventId::generate();
        self.inner.insert(id.clone(), PendingEvent::new(event, args));
        id
    }

    /// Drop a buffered event (the broker confirmed a replayed copy)
    pub fn remove(&self, id: &EventId) -> bool {
        self.inner.remove(id).is_some()
    }

    /// Read one buffered event
    pub fn get(&self, id: &EventId) -> Option<PendingEvent> {
        self.inner.get(id)
    }

    /// Ids of all buffered events
    pub fn keys(&self) -> Vec<EventId> {
        self.inner.keys()
    }

    /// All buffered events, keyed by id
    pub fn all(&self) -> BTreeMap<EventId, PendingEvent> {
        self.inner.all()
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Write the current state immediately
    pub fn save_now(&self) -> Result<(), StoreError> {
        self.inner.save_now()
    }

    /// Read a pending snapshot without opening a store around it
    ///
    /// The broker uses this cross-role read to drain events a communicator
    /// queued while offline; the file may be briefly stale due to the
    /// owner's debounced writes.
    pub fn load_snapshot(
        path: impl AsRef<Path>,
    ) -> Result<BTreeMap<EventId, PendingEvent>, StoreError> {
        read_snapshot(path.as_ref())
    }
}

// ----------------------------------------------------------------------------
// Failed Store (broker role)
// ----------------------------------------------------------------------------

/// Broker-side store of events whose handlers failed
#[derive(Debug, Clone)]
pub struct FailedStore {
    inner: Arc<QueueStore<FailedEvent>>,
}

impl FailedStore {
    /// Open the failed queue backed by `path`
    pub fn open(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            inner: Arc::new(QueueStore::open(path.into(), debounce)?),
        })
    }

    /// Record a handler failure under a stable id
    ///
    /// A first failure creates the record with an empty retry list; every
    /// later failure of the same id appends a retry attempt and replaces
    /// `last_error` in place.
    pub fn record_failure(
        &self,
        id: &EventId,
        event: &str,
        args: &[Value],
        error: ErrorDetails,
    ) {
        let appended = self
            .inner
            .mutate(id, |record| record.record_retry(error.clone()));

        if !appended {
            self.inner
                .insert(id.clone(), FailedEvent::new(event, args.to_vec(), error));
        }
    }

    /// Drop a record after a retry of it succeeded
    pub fn mark_successful(&self, id: &EventId) -> bool {
        self.inner.remove(id).is_some()
    }

    /// Whether a record exists for `id`
    pub fn contains(&self, id: &EventId) -> bool {
        self.inner.contains(id)
    }

    /// Read one failed record
    pub fn get(&self, id: &EventId) -> Option<FailedEvent> {
        self.inner.get(id)
    }

    /// Ids of all failed records
    pub fn keys(&self) -> Vec<EventId> {
        self.inner.keys()
    }

    /// Number of failed records
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// All failed records, keyed by id; the operator-facing listing
    pub fn list_failed(&self) -> BTreeMap<EventId, FailedEvent> {
        self.inner.all()
    }

    /// Distinct event names present in the failed queue
    pub fn list_failed_event_names(&self) -> BTreeSet<String> {
        self.inner
            .all()
            .into_values()
            .map(|record| record.event)
            .collect()
    }

    /// Operator delete of one record, persisted immediately
    pub fn delete_failed(&self, id: &EventId) -> Result<bool, StoreError> {
        let removed = self.inner.remove(id).is_some();
        if removed {
            self.inner.save_now()?;
        }
        Ok(removed)
    }

    /// Operator flush of the whole queue, persisted immediately
    pub fn flush_failed(&self) -> Result<usize, StoreError> {
        let drained = self.inner.clear();
        self.inner.save_now()?;
        Ok(drained)
    }

    /// Write the current state immediately
    pub fn save_now(&self) -> Result<(), StoreError> {
        self.inner.save_now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! StateStore — redb-backed state persistence for cutover.
//!
//! Provides typed operations over deployment records, traffic splits,
//! traffic targets, local revisions/services and deployment history. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! An on-disk store only holds the database file while a transaction is
//! running. redb locks the file for as long as it is open, so other
//! processes (a second `cutover` command, `cutover serve`) get their turn
//! between transactions. An open that finds the file busy retries until
//! the busy timeout runs out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use cutover_core::{DeploymentRecord, DeploymentReport, Revision, RevisionId, TrafficSplit};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// How long an operation waits for another process to release the file.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const BUSY_RETRY: Duration = Duration::from_millis(10);

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    /// Opened on demand. Concurrent transactions in this process share
    /// one handle; the file closes when the last of them finishes.
    File {
        path: Arc<PathBuf>,
        shared: Arc<Mutex<Weak<Database>>>,
        busy_timeout: Duration,
    },
    Memory(Arc<Database>),
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`StateStore::open`], waiting at most `busy_timeout` whenever
    /// another process has the file open.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> StateResult<Self> {
        let store = Self {
            backend: Backend::File {
                path: Arc::new(path.to_path_buf()),
                shared: Arc::default(),
                busy_timeout,
            },
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            backend: Backend::Memory(Arc::new(db)),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// The database handle for one operation.
    fn db(&self) -> StateResult<Arc<Database>> {
        match &self.backend {
            Backend::Memory(db) => Ok(db.clone()),
            Backend::File {
                path,
                shared,
                busy_timeout,
            } => {
                let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(db) = shared.upgrade() {
                    return Ok(db);
                }
                let db = Arc::new(open_file(path, *busy_timeout)?);
                *shared = Arc::downgrade(&db);
                Ok(db)
            }
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [RECORDS, SPLITS, TARGETS, REVISIONS, SERVICES, HISTORY] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(HISTORY_SEQ).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values keyed `{environment}:{id}`, in key order.
    fn list_prefixed<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        environment: &str,
    ) -> StateResult<Vec<T>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        entries_under(&table, environment)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(map_err!(Deserialize)))
            .collect()
    }

    // ── Deployment records ─────────────────────────────────────────

    /// Insert or replace an environment's deployment record.
    pub fn put_record(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put(RECORDS, &record.environment, record)?;
        debug!(environment = %record.environment, status = %record.status, "record stored");
        Ok(())
    }

    /// Get the deployment record of an environment.
    pub fn get_record(&self, environment: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(RECORDS, environment)
    }

    /// Read-modify-write a record inside one write transaction.
    ///
    /// A missing record starts from [`DeploymentRecord::new`].
    pub fn update_record<F>(&self, environment: &str, update: F) -> StateResult<DeploymentRecord>
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
            let existing: Option<Vec<u8>> = table
                .get(environment)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let mut record = match existing {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
                None => DeploymentRecord::new(environment),
            };
            update(&mut record);
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%environment, status = %record.status, "record updated");
        Ok(record)
    }

    // ── Traffic ────────────────────────────────────────────────────

    /// Replace an environment's traffic split.
    pub fn put_split(&self, split: &TrafficSplit) -> StateResult<()> {
        self.put(SPLITS, split.environment(), split)?;
        debug!(environment = split.environment(), %split, "split stored");
        Ok(())
    }

    pub fn get_split(&self, environment: &str) -> StateResult<Option<TrafficSplit>> {
        self.get(SPLITS, environment)
    }

    /// Insert or update a traffic target.
    pub fn put_target(&self, target: &TrafficTarget) -> StateResult<()> {
        self.put(TARGETS, &target.table_key(), target)
    }

    pub fn get_target(
        &self,
        environment: &str,
        revision: &RevisionId,
    ) -> StateResult<Option<TrafficTarget>> {
        self.get(TARGETS, &target_key(environment, revision))
    }

    pub fn list_targets(&self, environment: &str) -> StateResult<Vec<TrafficTarget>> {
        self.list_prefixed(TARGETS, environment)
    }

    // ── Local cluster ──────────────────────────────────────────────

    /// Store a registered revision. Re-storing an existing id is a no-op
    /// that keeps the original registration time.
    pub fn put_revision(&self, environment: &str, revision: &Revision) -> StateResult<Revision> {
        let key = format!("{environment}:{}", revision.id);
        if let Some(existing) = self.get::<Revision>(REVISIONS, &key)? {
            return Ok(existing);
        }
        self.put(REVISIONS, &key, revision)?;
        debug!(%environment, revision = %revision.id, "revision stored");
        Ok(revision.clone())
    }

    pub fn get_revision(
        &self,
        environment: &str,
        id: &RevisionId,
    ) -> StateResult<Option<Revision>> {
        self.get(REVISIONS, &format!("{environment}:{id}"))
    }

    /// Revisions of an environment, newest registration first.
    pub fn list_revisions(&self, environment: &str) -> StateResult<Vec<Revision>> {
        let mut revisions: Vec<Revision> = self.list_prefixed(REVISIONS, environment)?;
        revisions.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(revisions)
    }

    pub fn put_service(&self, binding: &ServiceBinding) -> StateResult<()> {
        self.put(SERVICES, &binding.environment, binding)
    }

    pub fn get_service(&self, environment: &str) -> StateResult<Option<ServiceBinding>> {
        self.get(SERVICES, environment)
    }

    // ── History ────────────────────────────────────────────────────

    /// Append a report to its environment's history. Returns its sequence number.
    pub fn append_report(&self, report: &DeploymentReport) -> StateResult<u64> {
        let environment = report.environment.as_str();
        let value = serde_json::to_vec(report).map_err(map_err!(Serialize))?;
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let mut counters = txn.open_table(HISTORY_SEQ).map_err(map_err!(Table))?;
            let next = counters
                .get(environment)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            seq = match next {
                Some(next) => next,
                // Histories written before the counter existed.
                None => entries_under(&history, environment)?.len() as u64,
            };
            let key = format!("{environment}:{seq:020}");
            history
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            counters
                .insert(environment, seq + 1)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%environment, seq, "report appended");
        Ok(seq)
    }

    /// Most recent reports first, at most `limit`.
    pub fn list_history(
        &self,
        environment: &str,
        limit: usize,
    ) -> StateResult<Vec<DeploymentReport>> {
        let mut reports: Vec<DeploymentReport> = self.list_prefixed(HISTORY, environment)?;
        reports.reverse();
        reports.truncate(limit);
        Ok(reports)
    }
}

fn open_file(path: &Path, busy_timeout: Duration) -> StateResult<Database> {
    let deadline = Instant::now() + busy_timeout;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(redb::DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                std::thread::sleep(BUSY_RETRY);
            }
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(StateError::Locked(path.display().to_string()));
            }
            Err(other) => return Err(StateError::Open(other.to_string())),
        }
    }
}

/// Raw values of the keys `{environment}:{id}`, in key order.
///
/// Scans from the prefix and stops at the first key outside it. Keys with
/// a further `:` after the prefix belong to another environment whose
/// name starts with `{environment}:`.
fn entries_under<T>(table: &T, environment: &str) -> StateResult<Vec<Vec<u8>>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = format!("{environment}:");
    let mut values = Vec::new();
    for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let Some(id) = key.value().strip_prefix(prefix.as_str()) else {
            break;
        };
        if id.contains(':') {
            continue;
        }
        values.push(value.value().to_vec());
    }
    Ok(values)
}

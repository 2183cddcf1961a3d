//! Testing utilities for the dataset cache
//!
//! In-memory doubles for the cache's collaborators:
//!
//! - **RecordingInstantiator**: produces `TableDataset`s (participant-capable)
//!   or `FileDataset`s (plain) and records every load
//! - **TableDataset**: transactional, metered dataset that records its lifecycle
//! - **FileDataset**: dataset with no transaction capability
//! - **RecordingParticipant**: keyless participant, optionally closeable
//! - **RecordingMetrics**: metrics context that records child contexts and counters
//!
//! # Example
//!
//! ```ignore
//! use strata_engine::testing::RecordingInstantiator;
//!
//! let instantiator = RecordingInstantiator::new();
//! let handle = instantiator.handle();
//! let mut cache = DatasetCache::new(Box::new(instantiator), coordinator, config, None)?;
//! cache.get_dataset::<TableDataset>("orders")?;
//! assert_eq!(handle.load_count("orders"), 1);
//! ```

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{
    Arguments, Closeable, Dataset, MeteredDataset, MetricsContext, StrataError, StrataResult,
    Transaction, TransactionParticipant,
};

use crate::instantiator::DatasetInstantiator;

// ============================================================================
// Datasets
// ============================================================================

#[derive(Default)]
struct TxLog {
    started: Vec<u64>,
    changes: Vec<Vec<u8>>,
    commits: u64,
    post_commits: u64,
    rollbacks: u64,
    refuse_commit: bool,
}

/// Transactional, metered dataset backed by nothing
pub struct TableDataset {
    name: String,
    closed: AtomicU64,
    fail_close: AtomicBool,
    metrics: Mutex<Option<Arc<dyn MetricsContext>>>,
    log: Mutex<TxLog>,
}

impl TableDataset {
    /// Create a table named `name`
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            closed: AtomicU64::new(0),
            fail_close: AtomicBool::new(false),
            metrics: Mutex::new(None),
            log: Mutex::new(TxLog::default()),
        })
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a change in the current transaction
    pub fn write(&self, change: &str) {
        self.log.lock().changes.push(change.as_bytes().to_vec());
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics.increment("writes", 1);
        }
    }

    /// Make every following `close` fail
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Make every following `commit_tx` refuse
    pub fn refuse_commit(&self) {
        self.log.lock().refuse_commit = true;
    }

    /// Number of `close` calls, failed ones included
    pub fn close_count(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether `close` was called at least once
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Whether a metrics collector was installed
    pub fn has_metrics(&self) -> bool {
        self.metrics.lock().is_some()
    }

    /// IDs of the transactions this table joined
    pub fn started(&self) -> Vec<u64> {
        self.log.lock().started.clone()
    }

    /// Number of `commit_tx` calls
    pub fn commits(&self) -> u64 {
        self.log.lock().commits
    }

    /// Number of `post_tx_commit` calls
    pub fn post_commits(&self) -> u64 {
        self.log.lock().post_commits
    }

    /// Number of `rollback_tx` calls
    pub fn rollbacks(&self) -> u64 {
        self.log.lock().rollbacks
    }
}

impl Closeable for TableDataset {
    fn close(&self) -> StrataResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StrataError::internal(format!("table '{}' refused to close", self.name)));
        }
        Ok(())
    }
}

impl Dataset for TableDataset {
    fn into_participant(self: Arc<Self>) -> Option<Arc<dyn TransactionParticipant>> {
        Some(self)
    }

    fn as_metered(&self) -> Option<&dyn MeteredDataset> {
        Some(self)
    }
}

impl MeteredDataset for TableDataset {
    fn set_metrics_collector(&self, metrics: Arc<dyn MetricsContext>) {
        *self.metrics.lock() = Some(metrics);
    }
}

impl TransactionParticipant for TableDataset {
    fn participant_name(&self) -> String {
        self.name.clone()
    }

    fn start_tx(&self, tx: &Transaction) {
        let mut log = self.log.lock();
        log.started.push(tx.txn_id);
        log.changes.clear();
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        self.log.lock().changes.clone()
    }

    fn commit_tx(&self) -> StrataResult<bool> {
        let mut log = self.log.lock();
        log.commits += 1;
        Ok(!log.refuse_commit)
    }

    fn post_tx_commit(&self) {
        self.log.lock().post_commits += 1;
    }

    fn rollback_tx(&self) -> StrataResult<bool> {
        let mut log = self.log.lock();
        log.rollbacks += 1;
        log.changes.clear();
        Ok(true)
    }
}

/// Dataset with no transaction capability
pub struct FileDataset {
    name: String,
    closed: AtomicU64,
    fail_close: AtomicBool,
}

impl FileDataset {
    /// Create a file set named `name`
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            closed: AtomicU64::new(0),
            fail_close: AtomicBool::new(false),
        })
    }

    /// File set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every following `close` fail
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Number of `close` calls, failed ones included
    pub fn close_count(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closeable for FileDataset {
    fn close(&self) -> StrataResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StrataError::internal(format!("file set '{}' refused to close", self.name)));
        }
        Ok(())
    }
}

impl Dataset for FileDataset {}

// ============================================================================
// Keyless participant
// ============================================================================

/// Participant that belongs to no dataset key
pub struct RecordingParticipant {
    name: String,
    closeable: bool,
    closed: AtomicU64,
    fail_close: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl RecordingParticipant {
    /// Participant without close capability
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), false)
    }

    /// Participant with close capability
    pub fn closeable(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), true)
    }

    fn build(name: String, closeable: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            closeable,
            closed: AtomicU64::new(0),
            fail_close: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Make every following `close` fail
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Number of `close` calls, failed ones included
    pub fn close_count(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transaction callbacks received, in order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Closeable for RecordingParticipant {
    fn close(&self) -> StrataResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StrataError::internal(format!("participant '{}' refused to close", self.name)));
        }
        Ok(())
    }
}

impl TransactionParticipant for RecordingParticipant {
    fn participant_name(&self) -> String {
        self.name.clone()
    }

    fn start_tx(&self, tx: &Transaction) {
        self.events.lock().push(format!("start:{}", tx.txn_id));
    }

    fn tx_changes(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn commit_tx(&self) -> StrataResult<bool> {
        self.events.lock().push("commit".to_string());
        Ok(true)
    }

    fn post_tx_commit(&self) {
        self.events.lock().push("post".to_string());
    }

    fn rollback_tx(&self) -> StrataResult<bool> {
        self.events.lock().push("rollback".to_string());
        Ok(true)
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        if self.closeable {
            Some(self)
        } else {
            None
        }
    }
}

// ============================================================================
// Instantiator
// ============================================================================

#[derive(Default)]
struct InstantiatorState {
    loads: Vec<(String, String, Arguments)>,
    tables: FxHashMap<String, Vec<Arc<TableDataset>>>,
    files: FxHashMap<String, Vec<Arc<FileDataset>>>,
    missing: FxHashSet<String>,
    failing: FxHashSet<String>,
    plain: FxHashSet<String>,
    closed: u64,
    fail_close: bool,
}

/// Instantiator that records every load
///
/// Clones share state, so a clone kept by the test observes the loads of the
/// instance handed to the cache.
#[derive(Clone, Default)]
pub struct RecordingInstantiator {
    state: Arc<Mutex<InstantiatorState>>,
}

impl RecordingInstantiator {
    /// Instantiator that produces a `TableDataset` for every name
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle sharing this instantiator's state
    pub fn handle(&self) -> Self {
        self.clone()
    }

    /// Loads of `name` report "does not exist"
    pub fn set_missing(&self, name: &str) {
        self.state.lock().missing.insert(name.to_string());
    }

    /// Loads of `name` fail
    pub fn set_failing(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    /// Loads of `name` produce a `FileDataset`
    pub fn set_plain(&self, name: &str) {
        self.state.lock().plain.insert(name.to_string());
    }

    /// Make `close` fail
    pub fn fail_close(&self) {
        self.state.lock().fail_close = true;
    }

    /// Number of loads of `name`, failed ones included
    pub fn load_count(&self, name: &str) -> usize {
        self.state.lock().loads.iter().filter(|(_, n, _)| n == name).count()
    }

    /// Arguments of the most recent load of `name`
    pub fn last_arguments(&self, name: &str) -> Option<Arguments> {
        self.state
            .lock()
            .loads
            .iter()
            .rev()
            .find(|(_, n, _)| n == name)
            .map(|(_, _, args)| args.clone())
    }

    /// Namespace of every load, in order
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().loads.iter().map(|(ns, _, _)| ns.clone()).collect()
    }

    /// The `index`-th table instantiated for `name`
    pub fn table(&self, name: &str, index: usize) -> Option<Arc<TableDataset>> {
        self.state.lock().tables.get(name).and_then(|t| t.get(index)).cloned()
    }

    /// Number of tables instantiated for `name`
    pub fn table_count(&self, name: &str) -> usize {
        self.state.lock().tables.get(name).map_or(0, Vec::len)
    }

    /// The `index`-th file set instantiated for `name`
    pub fn file(&self, name: &str, index: usize) -> Option<Arc<FileDataset>> {
        self.state.lock().files.get(name).and_then(|f| f.get(index)).cloned()
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> u64 {
        self.state.lock().closed
    }
}

impl DatasetInstantiator for RecordingInstantiator {
    fn load(
        &self,
        namespace: &str,
        name: &str,
        arguments: &Arguments,
    ) -> StrataResult<Option<Arc<dyn Dataset>>> {
        let mut state = self.state.lock();
        state
            .loads
            .push((namespace.to_string(), name.to_string(), arguments.clone()));

        if state.failing.contains(name) {
            return Err(StrataError::internal(format!(
                "backing store for '{}' unavailable",
                name
            )));
        }
        if state.missing.contains(name) {
            return Ok(None);
        }
        if state.plain.contains(name) {
            let file = FileDataset::new(name);
            state.files.entry(name.to_string()).or_default().push(Arc::clone(&file));
            return Ok(Some(file));
        }
        let table = TableDataset::new(name);
        state.tables.entry(name.to_string()).or_default().push(Arc::clone(&table));
        Ok(Some(table))
    }

    fn close(&self) -> StrataResult<()> {
        let mut state = self.state.lock();
        state.closed += 1;
        if state.fail_close {
            return Err(StrataError::internal("instantiator connection refused to close"));
        }
        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Default)]
struct MetricsLog {
    children: Vec<String>,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
}

/// Metrics context that records into shared state
pub struct RecordingMetrics {
    prefix: String,
    log: Arc<Mutex<MetricsLog>>,
}

impl RecordingMetrics {
    /// Root context
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            prefix: String::new(),
            log: Arc::new(Mutex::new(MetricsLog::default())),
        })
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Every child context created, as `tag=value` paths
    pub fn children(&self) -> Vec<String> {
        self.log.lock().children.clone()
    }

    /// Counter value by qualified name
    pub fn counter(&self, name: &str) -> u64 {
        self.log.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Gauge value by qualified name
    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.log.lock().gauges.get(name).copied()
    }
}

impl MetricsContext for RecordingMetrics {
    fn child(&self, tag: &str, value: &str) -> Arc<dyn MetricsContext> {
        let prefix = self.qualify(&format!("{}={}", tag, value));
        self.log.lock().children.push(prefix.clone());
        Arc::new(RecordingMetrics {
            prefix,
            log: Arc::clone(&self.log),
        })
    }

    fn increment(&self, metric: &str, delta: u64) {
        *self.log.lock().counters.entry(self.qualify(metric)).or_insert(0) += delta;
    }

    fn gauge(&self, metric: &str, value: i64) {
        self.log.lock().gauges.insert(self.qualify(metric), value);
    }
}

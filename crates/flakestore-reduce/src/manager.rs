//! Deduplication manager: background analysis of a file tree and
//! block-level rewriting of the candidates it finds.
//!
//! Two tokio tasks run while the manager is open. The analysis task walks the
//! tree every analysis interval and queues candidate files; the deduplication
//! task pops queued files one at a time and rewrites them. Storage work runs
//! on the blocking pool.

use std::collections::HashSet;
use std::sync::Arc;

use flakestore_fs::{File, FileTree, Node};
use flakestore_storage::CreateFlake;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DedupConfig;
use crate::dedup_table::DeduplicationTable;
use crate::error::{ReduceError, ReduceResult};
use crate::rewrite::{self, RewriteOutcome};

/// Lifecycle of a [`DeduplicationManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    /// Never opened.
    None,
    /// Starting the background tasks.
    InOpening,
    /// Background tasks running.
    Open,
    /// Waiting for the background tasks to stop.
    InClosure,
    /// Background tasks stopped.
    Closed,
}

/// Decides whether a file should be deduplicated.
pub trait CandidatePolicy: Send + Sync {
    /// True if `file` should be queued for a deduplication pass.
    fn is_candidate(&self, file: &File) -> bool;
}

/// Non-empty, unlocked files below a deduplication level.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCandidatePolicy {
    /// Files at this level or above are skipped.
    pub max_level: i8,
}

impl CandidatePolicy for DefaultCandidatePolicy {
    fn is_candidate(&self, file: &File) -> bool {
        if !file.is_valid() || file.is_empty() || file.is_locked() {
            return false;
        }
        match file.deduplication_description() {
            Ok(description) => description.level < self.max_level,
            Err(e) => {
                warn!(index = file.index(), error = %e, "unreadable deduplication description");
                false
            }
        }
    }
}

/// Counters of the deduplication manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Completed analysis passes.
    pub analysis_passes: u64,
    /// Files put on the work queue.
    pub files_queued: u64,
    /// Successful deduplication passes.
    pub files_deduplicated: u64,
    /// Successful expansion passes.
    pub files_expanded: u64,
    /// Passes that failed and left the file unchanged.
    pub failed_passes: u64,
    /// Full blocks replaced by references.
    pub blocks_referenced: u64,
    /// Blocks newly stored in the deduplication table.
    pub blocks_registered: u64,
    /// Content bytes before deduplication.
    pub bytes_before: u64,
    /// Content bytes after deduplication.
    pub bytes_after: u64,
}

#[derive(Default)]
struct WorkQueue {
    files: Vec<Arc<File>>,
    queued: HashSet<u64>,
}

struct Shared {
    config: DedupConfig,
    tree: Arc<dyn FileTree>,
    table: Arc<DeduplicationTable>,
    flakes: Arc<dyn CreateFlake>,
    policy: Arc<dyn CandidatePolicy>,
    queue: Mutex<WorkQueue>,
    wake: Notify,
    stats: Mutex<DedupStats>,
}

impl Shared {
    /// Walks the tree depth first with an explicit stack and queues candidates.
    fn analyze(&self) -> usize {
        let mut candidates = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![self.tree.root()];
        while let Some(directory) = pending.pop() {
            if !visited.insert(Arc::as_ptr(&directory)) {
                continue;
            }
            for node in directory.child_nodes() {
                match node {
                    Node::File(file) => {
                        if self.policy.is_candidate(&file) {
                            candidates.push(file);
                        }
                    }
                    Node::Directory(child) => pending.push(child),
                }
            }
        }

        let found = candidates.len();
        let queued = self.enqueue_all(candidates);
        self.stats.lock().analysis_passes += 1;
        debug!(
            directories = visited.len(),
            found, queued, "analyzed file tree"
        );
        queued
    }

    fn enqueue_all(&self, files: Vec<Arc<File>>) -> usize {
        let mut queue = self.queue.lock();
        let mut queued = 0;
        for file in files {
            if queue.queued.insert(file.index()) {
                queue.files.push(file);
                queued += 1;
            }
        }
        drop(queue);
        if queued > 0 {
            self.stats.lock().files_queued += queued as u64;
            self.wake.notify_one();
        }
        queued
    }

    fn pop(&self) -> Option<Arc<File>> {
        let mut queue = self.queue.lock();
        let file = queue.files.pop()?;
        queue.queued.remove(&file.index());
        Some(file)
    }

    /// Background entry point: skips files that stopped being candidates
    /// while they waited in the queue.
    fn process(&self, file: &Arc<File>) -> Option<RewriteOutcome> {
        if !self.policy.is_candidate(file) {
            debug!(index = file.index(), "skipping file that is no longer a candidate");
            return None;
        }
        match self.deduplicate(file) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(index = file.index(), error = %e, "deduplication pass failed");
                None
            }
        }
    }

    fn deduplicate(&self, file: &Arc<File>) -> ReduceResult<RewriteOutcome> {
        let result = rewrite::deduplicate_file(
            file,
            self.tree.as_ref(),
            &self.table,
            self.flakes.as_ref(),
        );
        let mut stats = self.stats.lock();
        match &result {
            Ok(outcome) => {
                stats.files_deduplicated += 1;
                stats.blocks_referenced += outcome.blocks;
                stats.blocks_registered += outcome.new_blocks;
                stats.bytes_before += outcome.length_before;
                stats.bytes_after += outcome.length_after;
            }
            Err(_) => stats.failed_passes += 1,
        }
        result
    }

    fn expand(&self, file: &Arc<File>) -> ReduceResult<RewriteOutcome> {
        let result = rewrite::expand_file(
            file,
            self.tree.as_ref(),
            &self.table,
            self.flakes.as_ref(),
        );
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.files_expanded += 1,
            Err(_) => stats.failed_passes += 1,
        }
        result
    }
}

async fn analysis_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.analysis_interval());
    loop {
        select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let worker = Arc::clone(&shared);
                if let Err(e) = tokio::task::spawn_blocking(move || worker.analyze()).await {
                    error!(error = %ReduceError::from(e), "analysis pass aborted");
                }
            }
        }
    }
    debug!("analysis task stopped");
}

async fn deduplication_loop(shared: Arc<Shared>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }
        let file = match shared.pop() {
            Some(file) => file,
            None => {
                select! {
                    _ = token.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                }
            }
        };

        // a started pass always runs to completion
        let worker = Arc::clone(&shared);
        if let Err(e) = tokio::task::spawn_blocking(move || worker.process(&file)).await {
            error!(error = %ReduceError::from(e), "deduplication pass aborted");
        }

        select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(shared.config.dedup_interval()) => {}
        }
    }
    debug!("deduplication task stopped");
}

/// Deduplicates the files of a tree in the background.
pub struct DeduplicationManager {
    shared: Arc<Shared>,
    state: Mutex<ManagerState>,
    shutdown: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeduplicationManager {
    /// Creates a closed manager using [`DefaultCandidatePolicy`].
    pub fn new(
        config: DedupConfig,
        tree: Arc<dyn FileTree>,
        table: Arc<DeduplicationTable>,
        flakes: Arc<dyn CreateFlake>,
    ) -> Self {
        let policy = Arc::new(DefaultCandidatePolicy {
            max_level: config.max_level,
        });
        Self::with_policy(config, tree, table, flakes, policy)
    }

    /// Creates a closed manager with a custom candidate policy.
    pub fn with_policy(
        config: DedupConfig,
        tree: Arc<dyn FileTree>,
        table: Arc<DeduplicationTable>,
        flakes: Arc<dyn CreateFlake>,
        policy: Arc<dyn CandidatePolicy>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                tree,
                table,
                flakes,
                policy,
                queue: Mutex::new(WorkQueue::default()),
                wake: Notify::new(),
                stats: Mutex::new(DedupStats::default()),
            }),
            state: Mutex::new(ManagerState::None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// The manager configuration.
    pub fn config(&self) -> &DedupConfig {
        &self.shared.config
    }

    /// The deduplication table.
    pub fn table(&self) -> &Arc<DeduplicationTable> {
        &self.shared.table
    }

    fn reject(&self, operation: &'static str, state: ManagerState) -> ReduceResult<()> {
        if self.shared.config.strict {
            return Err(ReduceError::InvalidState { operation, state });
        }
        debug!(operation, ?state, "ignoring manager state change");
        Ok(())
    }

    /// Starts the analysis and deduplication tasks on the current tokio runtime.
    pub fn open(&self) -> ReduceResult<()> {
        let runtime = Handle::try_current().map_err(|e| ReduceError::NoRuntime(e.to_string()))?;
        let mut state = self.state.lock();
        match *state {
            ManagerState::None | ManagerState::Closed => {}
            current => return self.reject("open", current),
        }
        *state = ManagerState::InOpening;

        let token = CancellationToken::new();
        let analysis = runtime.spawn(analysis_loop(Arc::clone(&self.shared), token.clone()));
        let deduplication =
            runtime.spawn(deduplication_loop(Arc::clone(&self.shared), token.clone()));
        *self.tasks.lock() = vec![analysis, deduplication];
        *self.shutdown.lock() = Some(token);

        *state = ManagerState::Open;
        info!(
            analysis_interval_ms = self.shared.config.analysis_interval_ms,
            dedup_interval_ms = self.shared.config.dedup_interval_ms,
            "deduplication manager open"
        );
        Ok(())
    }

    /// Stops both tasks and waits for them. A pass in progress finishes first.
    /// The manager is closed afterwards even if a task ended abnormally; that
    /// failure is returned as [`ReduceError::Worker`].
    pub async fn close(&self) -> ReduceResult<()> {
        let (token, tasks) = {
            let mut state = self.state.lock();
            if *state != ManagerState::Open {
                let current = *state;
                drop(state);
                return self.reject("close", current);
            }
            *state = ManagerState::InClosure;
            (
                self.shutdown.lock().take(),
                std::mem::take(&mut *self.tasks.lock()),
            )
        };

        if let Some(token) = token {
            token.cancel();
        }
        let mut failure = None;
        for task in tasks {
            if let Err(e) = task.await {
                let e = ReduceError::from(e);
                error!(error = %e, "deduplication manager task ended abnormally");
                failure.get_or_insert(e);
            }
        }

        *self.state.lock() = ManagerState::Closed;
        info!("deduplication manager closed");
        failure.map_or(Ok(()), Err)
    }

    /// Runs one analysis pass on the calling thread. Returns the number of
    /// files newly queued.
    pub fn analyze_now(&self) -> usize {
        self.shared.analyze()
    }

    /// Queues `file` for the deduplication task. Returns false if it is
    /// already queued.
    pub fn enqueue(&self, file: Arc<File>) -> bool {
        self.shared.enqueue_all(vec![file]) == 1
    }

    /// Number of queued files.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().files.len()
    }

    /// Deduplicates `file` on the calling thread, regardless of the candidate
    /// policy.
    pub fn deduplicate_file(&self, file: &Arc<File>) -> ReduceResult<RewriteOutcome> {
        self.shared.deduplicate(file)
    }

    /// Undoes one deduplication pass of `file` on the calling thread.
    pub fn expand_file(&self, file: &Arc<File>) -> ReduceResult<RewriteOutcome> {
        self.shared.expand(file)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DedupStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for DeduplicationManager {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
    }
}

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace};
use tuplepipe_error::{PipeError, Result};

use crate::buffer::TupleBuffer;
use crate::config::ExecutionConfig;
use crate::scheduler::{Placement, QueryPlacement, SchedulingPolicy, StageInfo};

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(0);

/// Progress counters for a single query.
#[derive(Debug, Default)]
pub struct QueryProgress {
    rows_scanned: AtomicU64,
    tuples_delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressSnapshot {
    pub rows_scanned: u64,
    pub tuples_delivered: u64,
}

impl QueryProgress {
    pub fn add_rows_scanned(&self, n: u64) {
        self.rows_scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tuples_delivered(&self, n: u64) {
        self.tuples_delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            tuples_delivered: self.tuples_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Execution context shared by every packet and worker of one query.
///
/// Owns the worker threads and knows every buffer in the plan so a failure
/// anywhere can unblock everything.
pub struct QueryState {
    id: u64,
    config: ExecutionConfig,
    policy: Arc<dyn SchedulingPolicy>,
    placement: Mutex<Option<Box<dyn QueryPlacement>>>,
    /// First error encountered, later ones are dropped.
    error: Mutex<Option<PipeError>>,
    failed: AtomicBool,
    buffers: Mutex<Vec<Arc<TupleBuffer>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_workers: AtomicUsize,
    progress: QueryProgress,
}

impl QueryState {
    pub fn new(policy: Arc<dyn SchedulingPolicy>, config: ExecutionConfig) -> Arc<Self> {
        let placement = policy.create_query_state();
        let id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
        debug!(query_id = id, policy = policy.name(), "created query state");

        Arc::new(QueryState {
            id,
            config,
            policy,
            placement: Mutex::new(Some(placement)),
            error: Mutex::new(None),
            failed: AtomicBool::new(false),
            buffers: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            progress: QueryProgress::default(),
        })
    }

    /// Query state using the policy named in `config`.
    pub fn with_config(config: ExecutionConfig) -> Arc<Self> {
        let policy = config.build_policy();
        Self::new(policy, config)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<dyn SchedulingPolicy> {
        &self.policy
    }

    pub fn progress(&self) -> &QueryProgress {
        &self.progress
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Track `buffer` so a failure can terminate it. Buffers built without
    /// an explicit capacity take the configured default.
    pub(crate) fn register_buffer(&self, buffer: Arc<TupleBuffer>) {
        buffer.apply_default_capacity(self.config.buffer_capacity);
        self.buffers.lock().push(buffer);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Error out if the query already failed. Used by stages doing long
    /// stretches of work without touching a buffer.
    pub fn check_running(&self) -> Result<()> {
        if self.is_failed() {
            Err(PipeError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Mark the query as failed and terminate every buffer in the plan.
    ///
    /// Only the first error is kept.
    pub fn fail(&self, err: PipeError) {
        {
            let mut slot = self.error.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!(query_id = self.id, %err, %existing, "ignoring secondary query error");
                    return;
                }
                None => {
                    error!(query_id = self.id, %err, "query failed");
                    *slot = Some(err);
                }
            }
        }
        self.failed.store(true, Ordering::Release);

        for buffer in self.buffers.lock().iter() {
            buffer.terminate();
        }
    }

    pub fn cancel(&self) {
        self.fail(PipeError::Canceled);
    }

    pub fn take_error(&self) -> Option<PipeError> {
        self.error.lock().take()
    }

    /// Worker count for `stage`. Stages that can't be replicated always get
    /// a single worker, whatever the placement asks for, and every stage
    /// gets at least one.
    pub fn workers_for(&self, stage: &StageInfo) -> usize {
        if !stage.replicable {
            return 1;
        }
        match self.placement.lock().as_ref() {
            Some(placement) => placement.workers_for(stage).max(1),
            None => 1,
        }
    }

    fn place(&self, stage: &StageInfo, worker: usize) -> Placement {
        match self.placement.lock().as_ref() {
            Some(placement) => placement.place(stage, worker),
            None => Placement::Unbound,
        }
    }

    /// Spawn a worker thread running `work`.
    ///
    /// When `output` is set the worker counts as one of its producers: a
    /// successful run calls `finish_producer`. Errors and panics fail the
    /// whole query.
    pub fn spawn_worker<F>(
        self: &Arc<Self>,
        stage: &StageInfo,
        worker: usize,
        output: Option<Arc<TupleBuffer>>,
        work: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let placement = self.place(stage, worker);
        let thread_name = format!("tuplepipe-{}-{}", stage.kind, worker);
        let worker_name = format!("{}/{}", stage.packet_name, worker);
        let state = self.clone();

        self.active_workers.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            placement.apply();
            trace!(worker = %worker_name, ?placement, "worker started");

            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(())) => {
                    trace!(worker = %worker_name, "worker finished");
                    if let Some(output) = &output {
                        output.finish_producer();
                    }
                }
                Ok(Err(e)) => {
                    debug!(worker = %worker_name, %e, "worker failed");
                    state.fail(e);
                }
                Err(panic) => {
                    let message = format_worker_panic(panic);
                    error!(worker = %worker_name, %message, "worker panicked");
                    state.fail(PipeError::WorkerPanicked {
                        worker: worker_name,
                        message,
                    });
                }
            }

            state.active_workers.fetch_sub(1, Ordering::AcqRel);
        });

        match spawned {
            Ok(handle) => {
                self.workers.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.active_workers.fetch_sub(1, Ordering::AcqRel);
                Err(e.into())
            }
        }
    }

    /// Block until every spawned worker exited.
    pub fn join_workers(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!(query_id = self.id, "worker thread exited abnormally");
                }
            }
        }
    }

    /// Join all workers and hand placement state back to the policy.
    pub fn destroy(&self) {
        self.join_workers();
        if let Some(placement) = self.placement.lock().take() {
            self.policy.destroy_query_state(placement);
            debug!(query_id = self.id, progress = ?self.progress.snapshot(), "destroyed query state");
        }
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("id", &self.id)
            .field("policy", &self.policy.name())
            .field("failed", &self.is_failed())
            .field("active_workers", &self.active_workers())
            .finish_non_exhaustive()
    }
}

/// Formats a panic payload caught from a worker.
fn format_worker_panic(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "UNKNOWN".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::buffer::BufferOptions;
    use crate::scheduler::testutil::stage;
    use crate::scheduler::{OsPolicy, StageKind};

    fn query() -> Arc<QueryState> {
        QueryState::new(Arc::new(OsPolicy), ExecutionConfig::default())
    }

    /// Asks for the same worker count for every stage.
    #[derive(Debug)]
    struct FixedWorkers(usize);

    impl SchedulingPolicy for FixedWorkers {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn create_query_state(&self) -> Box<dyn QueryPlacement> {
            Box::new(FixedWorkers(self.0))
        }
    }

    impl QueryPlacement for FixedWorkers {
        fn workers_for(&self, _stage: &StageInfo) -> usize {
            self.0
        }

        fn place(&self, _stage: &StageInfo, _worker: usize) -> Placement {
            Placement::Unbound
        }
    }

    #[test]
    fn worker_counts_clamped() {
        let many = QueryState::new(Arc::new(FixedWorkers(3)), ExecutionConfig::default());
        assert_eq!(1, many.workers_for(&stage(1, StageKind::Scan, false, 1)));
        assert_eq!(1, many.workers_for(&stage(2, StageKind::Sort, false, 1)));
        assert_eq!(3, many.workers_for(&stage(3, StageKind::Sieve, true, 2)));

        let none = QueryState::new(Arc::new(FixedWorkers(0)), ExecutionConfig::default());
        assert_eq!(1, none.workers_for(&stage(4, StageKind::FilterProject, true, 2)));
        assert_eq!(1, none.workers_for(&stage(5, StageKind::Aggregate, false, 1)));
    }

    #[test]
    fn registered_buffers_take_configured_capacity() {
        let config = ExecutionConfig {
            buffer_capacity: 7,
            ..Default::default()
        };
        let qs = QueryState::new(Arc::new(OsPolicy), config);

        let sized = TupleBuffer::new_shared("sized", 4, BufferOptions::with_capacity(2)).unwrap();
        let default_sized = TupleBuffer::new_shared("unsized", 4, BufferOptions::default()).unwrap();
        qs.register_buffer(sized.clone());
        qs.register_buffer(default_sized.clone());

        assert_eq!(2, sized.capacity());
        assert_eq!(7, default_sized.capacity());
    }

    #[test]
    fn first_error_wins() {
        let qs = query();
        qs.fail(PipeError::Scan("bad row".to_string()));
        qs.cancel();
        assert!(qs.is_failed());
        assert!(matches!(qs.take_error(), Some(PipeError::Scan(_))));
    }

    #[test]
    fn fail_terminates_buffers() {
        let qs = query();
        let buf = TupleBuffer::new_shared("out", 4, BufferOptions::default()).unwrap();
        qs.register_buffer(buf.clone());

        qs.cancel();
        assert!(buf.is_terminated());
        assert!(qs.check_running().is_err());
    }

    #[test]
    fn worker_success_finishes_producer() {
        let qs = query();
        let buf = TupleBuffer::new_shared("out", 4, BufferOptions::default()).unwrap();
        buf.add_producers(1);

        let s = stage(1, StageKind::Scan, false, 1);
        let out = buf.clone();
        qs.spawn_worker(&s, 0, Some(buf.clone()), move || {
            out.put(crate::tuple::Tuple::zeroed(4))?;
            Ok(())
        })
        .unwrap();
        qs.destroy();

        assert!(buf.get().unwrap().is_some());
        assert_eq!(None, buf.get().unwrap());
        assert_eq!(0, qs.active_workers());
        assert!(qs.take_error().is_none());
    }

    #[test]
    fn worker_panic_fails_query() {
        let qs = query();
        let s = stage(1, StageKind::Sort, false, 1);
        qs.spawn_worker(&s, 0, None, || panic!("sort exploded")).unwrap();
        qs.join_workers();

        match qs.take_error() {
            Some(PipeError::WorkerPanicked { message, .. }) => {
                assert_eq!("sort exploded", message)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cancel_unblocks_worker() {
        let qs = query();
        let buf = TupleBuffer::new_shared("in", 4, BufferOptions::default()).unwrap();
        qs.register_buffer(buf.clone());

        let s = stage(1, StageKind::FilterProject, true, 1);
        qs.spawn_worker(&s, 0, None, move || {
            while buf.get()?.is_some() {}
            Ok(())
        })
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        qs.cancel();
        qs.destroy();
        assert!(matches!(qs.take_error(), Some(PipeError::Canceled)));
    }
}

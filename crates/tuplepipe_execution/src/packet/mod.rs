//! Plan graph nodes.
//!
//! A packet owns its output buffer and references the packets feeding it.
//! Packets are immutable once built, except for being attached to a query
//! and started exactly once.

pub mod aggregate;
pub mod filter_project;
pub mod hash_join;
pub mod scan;
pub mod sieve;
pub mod sort;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashSet;
use tracing::debug;
use tuplepipe_error::{plan_err, Result};

use crate::buffer::{BufferOptions, TupleBuffer};
use crate::query::QueryState;
use crate::scheduler::{StageInfo, StageKind};

pub use hash_join::HashJoinOptions;

pub type PacketRef = Arc<Packet>;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub enum PacketKind {
    Scan(scan::ScanStage),
    FilterProject(filter_project::FilterProjectStage),
    Sieve(sieve::SieveStage),
    HashJoin(hash_join::HashJoinStage),
    Sort(sort::SortStage),
    Aggregate(aggregate::AggregateStage),
    PartialAggregate(aggregate::PartialAggregateStage),
}

impl PacketKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Scan(_) => "scan",
            PacketKind::FilterProject(_) => "filter_project",
            PacketKind::Sieve(_) => "sieve",
            PacketKind::HashJoin(_) => "hash_join",
            PacketKind::Sort(_) => "sort",
            PacketKind::Aggregate(_) => "aggregate",
            PacketKind::PartialAggregate(_) => "partial_aggregate",
        }
    }
}

pub struct Packet {
    id: u64,
    name: String,
    output: Arc<TupleBuffer>,
    inputs: Vec<PacketRef>,
    kind: PacketKind,
    /// Requested workers for replicable stages, 0 uses the query default.
    parallelism: AtomicUsize,
    query: OnceLock<Arc<QueryState>>,
    started: AtomicBool,
}

impl Packet {
    fn build(
        name: impl Into<String>,
        output_size: usize,
        opts: BufferOptions,
        inputs: Vec<PacketRef>,
        kind: PacketKind,
    ) -> Result<PacketRef> {
        let name = name.into();
        let output = TupleBuffer::new_shared(name.clone(), output_size, opts)?;
        Ok(Arc::new(Packet {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            name,
            output,
            inputs,
            kind,
            parallelism: AtomicUsize::new(0),
            query: OnceLock::new(),
            started: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PacketKind {
        &self.kind
    }

    pub fn output(&self) -> &Arc<TupleBuffer> {
        &self.output
    }

    pub fn output_size(&self) -> usize {
        self.output.tuple_size()
    }

    pub fn inputs(&self) -> &[PacketRef] {
        &self.inputs
    }

    pub fn query_state(&self) -> Option<&Arc<QueryState>> {
        self.query.get()
    }

    /// Request a worker count for this packet's replicable stage. Ignored by
    /// stages that can't be replicated.
    pub fn set_parallelism(&self, workers: usize) {
        self.parallelism.store(workers, Ordering::Relaxed);
    }

    fn input(&self, idx: usize) -> &PacketRef {
        &self.inputs[idx]
    }

    fn stage_info(&self, kind: StageKind, replicable: bool, qs: &QueryState) -> StageInfo {
        let default_workers = if replicable {
            match self.parallelism.load(Ordering::Relaxed) {
                0 => qs.config().stage_parallelism,
                n => n,
            }
        } else {
            1
        };
        StageInfo {
            packet_id: self.id,
            packet_name: self.name.clone(),
            kind,
            replicable,
            default_workers,
        }
    }

    /// Spawn the workers producing into this packet's output buffer.
    ///
    /// `make_worker` is called once per worker index.
    fn spawn_producers<F, W>(
        &self,
        qs: &Arc<QueryState>,
        stage: &StageInfo,
        mut make_worker: F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize) -> W,
        W: FnOnce() -> Result<()> + Send + 'static,
    {
        let workers = qs.workers_for(stage);
        self.output.add_producers(workers);
        for idx in 0..workers {
            qs.spawn_worker(stage, idx, Some(self.output.clone()), make_worker(idx, workers))?;
        }
        debug!(packet = %self.name, kind = %stage.kind, workers, "started stage");
        Ok(())
    }

    /// Start this packet's stage. Inputs must have been started already.
    fn start(&self, qs: &Arc<QueryState>) -> Result<()> {
        match self.query.get() {
            Some(attached) if Arc::ptr_eq(attached, qs) => (),
            _ => {
                return Err(plan_err!(
                    "packet '{}' is not attached to query {}",
                    self.name,
                    qs.id()
                ))
            }
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(plan_err!("packet '{}' was already executed", self.name));
        }

        match &self.kind {
            PacketKind::Scan(stage) => stage.start(self, qs),
            PacketKind::FilterProject(stage) => stage.start(self, qs),
            PacketKind::Sieve(stage) => stage.start(self, qs),
            PacketKind::HashJoin(stage) => stage.start(self, qs),
            PacketKind::Sort(stage) => stage.start(self, qs),
            PacketKind::Aggregate(stage) => stage.start(self, qs),
            PacketKind::PartialAggregate(stage) => stage.start(self, qs),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.as_str())
            .field("output_size", &self.output_size())
            .field("inputs", &self.inputs.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Check that `input` produces tuples of the size a consumer expects.
fn check_input_size(consumer: &str, input: &Packet, expected: usize) -> Result<()> {
    if input.output_size() != expected {
        return Err(plan_err!(
            "'{consumer}' expects {expected} byte tuples but '{}' produces {} byte tuples",
            input.name(),
            input.output_size()
        ));
    }
    Ok(())
}

/// Attach every packet reachable from `root` to `qs`.
///
/// Each packet may feed a single consumer and belong to a single query.
pub fn assign_query_state(root: &PacketRef, qs: &Arc<QueryState>) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(packet) = stack.pop() {
        if !seen.insert(packet.id) {
            return Err(plan_err!(
                "packet '{}' feeds more than one consumer",
                packet.name
            ));
        }

        if packet.query.set(qs.clone()).is_err() {
            let attached = packet.query.get();
            if !attached.is_some_and(|attached| Arc::ptr_eq(attached, qs)) {
                return Err(plan_err!(
                    "packet '{}' is already attached to another query",
                    packet.name
                ));
            }
        }
        qs.register_buffer(packet.output.clone());

        stack.extend(packet.inputs.iter());
    }

    Ok(())
}

/// Start every packet reachable from `root`, inputs before consumers.
pub(crate) fn start_all(root: &PacketRef, qs: &Arc<QueryState>) -> Result<()> {
    for input in root.inputs() {
        start_all(input, qs)?;
    }
    root.start(qs)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::*;
    use crate::operators::TrivialFilter;
    use crate::storage::{MemoryTable, Table, TransactionContext};
    use crate::tuple::schema::{TupleSchema, Value};
    use crate::tuple::Tuple;

    /// Table of (i32 k, i32 v) rows.
    pub fn kv_table(rows: &[(i32, i32)]) -> Arc<dyn Table> {
        let schema = TupleSchema::builder().int32("k").int32("v").build();
        let table = MemoryTable::new("kv", schema);
        for (k, v) in rows {
            table.insert(&[Value::Int32(*k), Value::Int32(*v)]).unwrap();
        }
        Arc::new(table)
    }

    pub fn kv_scan(name: &str, rows: &[(i32, i32)]) -> PacketRef {
        Packet::scan(
            name,
            BufferOptions::with_capacity(4),
            kv_table(rows),
            TransactionContext::default(),
            Box::new(TrivialFilter::new(8)),
        )
        .unwrap()
    }

    /// Attach, start and drain a plan, returning its output.
    pub fn run(root: &PacketRef) -> Result<Vec<Tuple>> {
        logutil::init_test();
        let qs = QueryState::with_config(Default::default());
        assign_query_state(root, &qs)?;
        let mut out = Vec::new();
        let res = start_all(root, &qs).and_then(|_| {
            while let Some(t) = root.output().get()? {
                out.push(t);
            }
            Ok(())
        });
        if let Err(e) = res {
            qs.fail(e);
        }
        qs.destroy();
        match qs.take_error() {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    pub fn pairs(tuples: &[Tuple]) -> Vec<(i32, i32)> {
        tuples
            .iter()
            .map(|t| (t.read_i32(0).unwrap(), t.read_i32(4).unwrap()))
            .collect()
    }
}

//! Mapping stage workers onto threads and cores.
//!
//! Policies only decide worker counts and placement. Query results never
//! depend on which policy is active.

pub mod cpu_set;
pub mod os;
pub mod per_query;
pub mod round_robin;

use std::fmt::{self, Debug};

use core_affinity::CoreId;
use tracing::warn;

pub use cpu_set::CpuSet;
pub use os::OsPolicy;
pub use per_query::PerQueryCpuPolicy;
pub use round_robin::{RoundRobinCpuPolicy, RoundRobinModulePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Scan,
    FilterProject,
    Sieve,
    HashJoinBuild,
    HashJoinProbe,
    Sort,
    Aggregate,
    PartialAggregate,
}

impl StageKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scan => "scan",
            StageKind::FilterProject => "filter_project",
            StageKind::Sieve => "sieve",
            StageKind::HashJoinBuild => "hash_join_build",
            StageKind::HashJoinProbe => "hash_join_probe",
            StageKind::Sort => "sort",
            StageKind::Aggregate => "aggregate",
            StageKind::PartialAggregate => "partial_aggregate",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a policy gets to see about a stage when placing its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub packet_id: u64,
    pub packet_name: String,
    pub kind: StageKind,
    /// Whether the stage's operator may run in several workers at once.
    pub replicable: bool,
    /// Worker count the plan asks for. Always 1 for stages that aren't
    /// replicable.
    pub default_workers: usize,
}

/// Where a single worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Let the OS decide.
    Unbound,
    /// Pin to a core.
    Core(usize),
}

impl Placement {
    /// Apply to the current thread. Failure to pin is logged and otherwise
    /// ignored.
    pub fn apply(&self) {
        if let Placement::Core(id) = self {
            if !core_affinity::set_for_current(CoreId { id: *id }) {
                warn!(core = id, "failed to set core affinity for worker");
            }
        }
    }
}

/// Pluggable strategy mapping stages to worker threads.
pub trait SchedulingPolicy: Debug + Sync + Send {
    fn name(&self) -> &'static str;

    /// Create the per-query placement state. Called once when a query state
    /// is created.
    fn create_query_state(&self) -> Box<dyn QueryPlacement>;

    /// Release per-query placement state once every worker of the query
    /// joined.
    fn destroy_query_state(&self, _state: Box<dyn QueryPlacement>) {}
}

/// Per-query placement decisions.
pub trait QueryPlacement: Debug + Sync + Send {
    /// Workers to run for a stage. Only honored for replicable stages, and
    /// never below one.
    fn workers_for(&self, stage: &StageInfo) -> usize {
        if stage.replicable {
            stage.default_workers.max(1)
        } else {
            1
        }
    }

    fn place(&self, stage: &StageInfo, worker: usize) -> Placement;
}

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{CpuSet, Placement, QueryPlacement, SchedulingPolicy, StageInfo, StageKind};

/// Pins every worker to the next core, across all queries.
#[derive(Debug, Clone)]
pub struct RoundRobinCpuPolicy {
    cpus: Arc<CpuSet>,
}

impl RoundRobinCpuPolicy {
    pub fn new(cpus: CpuSet) -> Self {
        RoundRobinCpuPolicy {
            cpus: Arc::new(cpus),
        }
    }
}

impl Default for RoundRobinCpuPolicy {
    fn default() -> Self {
        Self::new(CpuSet::detect())
    }
}

impl SchedulingPolicy for RoundRobinCpuPolicy {
    fn name(&self) -> &'static str {
        "rr_cpu"
    }

    fn create_query_state(&self) -> Box<dyn QueryPlacement> {
        Box::new(RoundRobinCpuPlacement {
            cpus: self.cpus.clone(),
        })
    }
}

#[derive(Debug)]
struct RoundRobinCpuPlacement {
    cpus: Arc<CpuSet>,
}

impl QueryPlacement for RoundRobinCpuPlacement {
    fn place(&self, _stage: &StageInfo, _worker: usize) -> Placement {
        Placement::Core(self.cpus.next_core())
    }
}

/// Pins each kind of stage to its own core. Kinds get cores round robin the
/// first time they're seen, and keep them for the lifetime of the policy.
#[derive(Debug, Clone)]
pub struct RoundRobinModulePolicy {
    inner: Arc<ModuleAssignments>,
}

#[derive(Debug)]
struct ModuleAssignments {
    cpus: CpuSet,
    assigned: Mutex<HashMap<StageKind, usize>>,
}

impl ModuleAssignments {
    fn core_for(&self, kind: StageKind) -> usize {
        *self
            .assigned
            .lock()
            .entry(kind)
            .or_insert_with(|| self.cpus.next_core())
    }
}

impl RoundRobinModulePolicy {
    pub fn new(cpus: CpuSet) -> Self {
        RoundRobinModulePolicy {
            inner: Arc::new(ModuleAssignments {
                cpus,
                assigned: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for RoundRobinModulePolicy {
    fn default() -> Self {
        Self::new(CpuSet::detect())
    }
}

impl SchedulingPolicy for RoundRobinModulePolicy {
    fn name(&self) -> &'static str {
        "rr_module"
    }

    fn create_query_state(&self) -> Box<dyn QueryPlacement> {
        Box::new(RoundRobinModulePlacement {
            inner: self.inner.clone(),
        })
    }
}

#[derive(Debug)]
struct RoundRobinModulePlacement {
    inner: Arc<ModuleAssignments>,
}

impl QueryPlacement for RoundRobinModulePlacement {
    fn place(&self, stage: &StageInfo, _worker: usize) -> Placement {
        Placement::Core(self.inner.core_for(stage.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::stage;
    use super::*;

    #[test]
    fn rr_cpu_spreads_workers() {
        let policy = RoundRobinCpuPolicy::new(CpuSet::from_cores(vec![0, 1, 2]));
        let q1 = policy.create_query_state();
        let q2 = policy.create_query_state();
        let s = stage(1, StageKind::FilterProject, true, 2);

        assert_eq!(Placement::Core(0), q1.place(&s, 0));
        assert_eq!(Placement::Core(1), q1.place(&s, 1));
        // Rotation is shared between queries.
        assert_eq!(Placement::Core(2), q2.place(&s, 0));
        assert_eq!(Placement::Core(0), q2.place(&s, 1));
    }

    #[test]
    fn rr_module_pins_kinds() {
        let policy = RoundRobinModulePolicy::new(CpuSet::from_cores(vec![4, 7]));
        let q = policy.create_query_state();
        let scan = stage(1, StageKind::Scan, false, 1);
        let filter = stage(2, StageKind::FilterProject, true, 3);
        let other_scan = stage(3, StageKind::Scan, false, 1);

        assert_eq!(Placement::Core(4), q.place(&scan, 0));
        assert_eq!(Placement::Core(7), q.place(&filter, 0));
        assert_eq!(Placement::Core(7), q.place(&filter, 2));
        assert_eq!(Placement::Core(4), q.place(&other_scan, 0));

        let q2 = policy.create_query_state();
        assert_eq!(Placement::Core(7), q2.place(&filter, 0));
    }
}

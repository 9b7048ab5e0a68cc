use std::sync::Arc;

use tracing::debug;

use super::{CpuSet, Placement, QueryPlacement, SchedulingPolicy, StageInfo};

/// Runs every worker of a query on the same core. Successive queries rotate
/// through the available cores.
#[derive(Debug, Clone)]
pub struct PerQueryCpuPolicy {
    cpus: Arc<CpuSet>,
}

impl PerQueryCpuPolicy {
    pub fn new(cpus: CpuSet) -> Self {
        PerQueryCpuPolicy {
            cpus: Arc::new(cpus),
        }
    }
}

impl Default for PerQueryCpuPolicy {
    fn default() -> Self {
        Self::new(CpuSet::detect())
    }
}

impl SchedulingPolicy for PerQueryCpuPolicy {
    fn name(&self) -> &'static str {
        "query_cpu"
    }

    fn create_query_state(&self) -> Box<dyn QueryPlacement> {
        let core = self.cpus.next_core();
        debug!(core, "assigned query to core");
        Box::new(PerQueryPlacement { core })
    }

    fn destroy_query_state(&self, state: Box<dyn QueryPlacement>) {
        debug!(?state, "released query core");
    }
}

#[derive(Debug)]
struct PerQueryPlacement {
    core: usize,
}

impl QueryPlacement for PerQueryPlacement {
    fn place(&self, _stage: &StageInfo, _worker: usize) -> Placement {
        Placement::Core(self.core)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::stage;
    use super::super::StageKind;
    use super::*;

    #[test]
    fn one_core_per_query() {
        let policy = PerQueryCpuPolicy::new(CpuSet::from_cores(vec![2, 3]));
        let q1 = policy.create_query_state();
        let q2 = policy.create_query_state();

        let scan = stage(1, StageKind::Scan, false, 1);
        let sort = stage(2, StageKind::Sort, false, 1);

        assert_eq!(Placement::Core(2), q1.place(&scan, 0));
        assert_eq!(Placement::Core(2), q1.place(&sort, 0));
        assert_eq!(Placement::Core(3), q2.place(&scan, 0));

        policy.destroy_query_state(q1);
    }
}

use super::{Placement, QueryPlacement, SchedulingPolicy, StageInfo};

/// Leaves placement to the OS scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPolicy;

impl SchedulingPolicy for OsPolicy {
    fn name(&self) -> &'static str {
        "os"
    }

    fn create_query_state(&self) -> Box<dyn QueryPlacement> {
        Box::new(OsPlacement)
    }
}

#[derive(Debug)]
struct OsPlacement;

impl QueryPlacement for OsPlacement {
    fn place(&self, _stage: &StageInfo, _worker: usize) -> Placement {
        Placement::Unbound
    }
}

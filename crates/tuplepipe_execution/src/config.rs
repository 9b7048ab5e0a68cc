use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tuplepipe_error::{PipeError, Result};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::scheduler::{
    OsPolicy, PerQueryCpuPolicy, RoundRobinCpuPolicy, RoundRobinModulePolicy, SchedulingPolicy,
};

/// Inputs larger than this get sorted on the rayon pool.
pub const DEFAULT_PARALLEL_SORT_THRESHOLD: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// No pinning.
    #[default]
    Os,
    /// Every worker on the next core.
    RrCpu,
    /// Every stage kind on its own core.
    RrModule,
    /// Every query on its own core.
    QueryCpu,
}

impl PolicyKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Os => "os",
            PolicyKind::RrCpu => "rr_cpu",
            PolicyKind::RrModule => "rr_module",
            PolicyKind::QueryCpu => "query_cpu",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "os" => PolicyKind::Os,
            "rr_cpu" => PolicyKind::RrCpu,
            "rr_module" => PolicyKind::RrModule,
            "query_cpu" => PolicyKind::QueryCpu,
            other => {
                return Err(PipeError::Config(format!(
                    "unknown scheduling policy '{other}'"
                )))
            }
        })
    }
}

/// Knobs for executing queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Tuples held by a buffer before its producers block, for buffers built
    /// without an explicit capacity.
    pub buffer_capacity: usize,
    /// Workers spawned per replicable stage.
    pub stage_parallelism: usize,
    pub policy: PolicyKind,
    /// Fail queries that take longer than this.
    pub query_timeout_ms: Option<u64>,
    pub parallel_sort_threshold: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            stage_parallelism: num_cpus::get().clamp(1, 4),
            policy: PolicyKind::default(),
            query_timeout_ms: None,
            parallel_sort_threshold: DEFAULT_PARALLEL_SORT_THRESHOLD,
        }
    }
}

impl ExecutionConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: ExecutionConfig =
            serde_json::from_str(s).map_err(|e| PipeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(PipeError::Config(
                "buffer_capacity must be non-zero".to_string(),
            ));
        }
        if self.stage_parallelism == 0 {
            return Err(PipeError::Config(
                "stage_parallelism must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn build_policy(&self) -> Arc<dyn SchedulingPolicy> {
        match self.policy {
            PolicyKind::Os => Arc::new(OsPolicy),
            PolicyKind::RrCpu => Arc::new(RoundRobinCpuPolicy::default()),
            PolicyKind::RrModule => Arc::new(RoundRobinModulePolicy::default()),
            PolicyKind::QueryCpu => Arc::new(PerQueryCpuPolicy::default()),
        }
    }
}

//! Errors produced while building and executing dataflow plans.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The plan is malformed: mismatched tuple sizes between adjacent
    /// packets, key ranges outside of a tuple, zero capacities, or a packet
    /// attached to more than one query.
    #[error("invalid plan: {0}")]
    PlanConstruction(String),

    /// The storage collaborator failed to produce or decode a row.
    #[error("scan failed: {0}")]
    Scan(String),

    /// An operator callback failed.
    #[error("operator failed: {0}")]
    Operator(String),

    #[error("worker '{worker}' panicked: {message}")]
    WorkerPanicked { worker: String, message: String },

    /// A stage observed its buffer being terminated instead of reaching a
    /// normal end of stream.
    #[error("buffer '{buffer}' closed before end of stream")]
    BufferClosedPrematurely { buffer: String },

    #[error("tuple access out of bounds: {len} bytes at offset {offset} in a {size} byte tuple")]
    TupleAccess {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("query exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("query canceled")]
    Canceled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipeError {
    /// Returns true if this error is only a consequence of some other
    /// failure, e.g. a stage noticing its input buffer got terminated because
    /// an upstream stage failed.
    pub fn is_abort(&self) -> bool {
        matches!(self, PipeError::BufferClosedPrematurely { .. })
    }
}

pub type Result<T, E = PipeError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::PipeError::Internal(std::format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plan_err {
    ($($arg:tt)*) => {
        $crate::PipeError::PlanConstruction(std::format!($($arg)*))
    };
}

#[macro_export]
macro_rules! operator_err {
    ($($arg:tt)*) => {
        $crate::PipeError::Operator(std::format!($($arg)*))
    };
}

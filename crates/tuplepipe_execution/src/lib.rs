//! Pipelined, parallel tuple dataflow engine.
//!
//! Plans are trees of packets connected by bounded tuple buffers. Every
//! packet runs as one or more worker threads pulling from its inputs and
//! pushing into its own output buffer. `process_query` starts a plan and
//! drains its root on the calling thread.

pub mod buffer;
pub mod config;
pub mod driver;
pub mod key;
pub mod operators;
pub mod packet;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod tuple;
pub mod util;

pub use buffer::{BufferOptions, TupleBuffer};
pub use config::{ExecutionConfig, PolicyKind};
pub use driver::{process_query, CollectConsumer, TupleConsumer};
pub use packet::{assign_query_state, HashJoinOptions, Packet, PacketRef};
pub use query::QueryState;
pub use tuple::Tuple;

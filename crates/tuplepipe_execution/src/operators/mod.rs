//! Operator contracts run by stages.
//!
//! Every operator is cloned once per worker so each worker owns its own
//! scratch state. Cloning goes through `dyn_clone` so operators can live
//! behind `Box<dyn ...>` handles.

pub mod aggregate;
pub mod filter;
pub mod join;
pub mod predicate;
pub mod sieve;

pub use aggregate::{Aggregate, AggregateExpr, SimpleAggregate};
pub use filter::{Filter, FnFilter, LimitFilter, PredicateFilter, TrivialFilter};
pub use join::{ConcatJoin, Join, JoinKeys};
pub use predicate::{ByteRange, CompareOp, Predicate, Projection, Scalar};
pub use sieve::{FnSieve, Sieve};

//! Runs a plan to completion on the calling thread.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tuplepipe_error::{plan_err, PipeError, Result};

use crate::buffer::PollGet;
use crate::packet::{start_all, PacketRef};
use crate::query::QueryState;
use crate::tuple::Tuple;

/// Terminal consumer of a query's results.
pub trait TupleConsumer {
    /// Called once before the first tuple is delivered.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple) -> Result<()>;
}

/// Consumer keeping every delivered tuple.
#[derive(Debug, Default)]
pub struct CollectConsumer {
    pub tuples: Vec<Tuple>,
    pub began: bool,
}

impl TupleConsumer for CollectConsumer {
    fn begin(&mut self) -> Result<()> {
        self.began = true;
        Ok(())
    }

    fn process(&mut self, tuple: &Tuple) -> Result<()> {
        self.tuples.push(tuple.clone());
        Ok(())
    }
}

/// Execute the plan rooted at `root`, delivering its output to `consumer`.
///
/// Every packet of the plan must have been attached to a query with
/// `assign_query_state`. Returns once all workers of the query were joined.
/// On error, tuples already handed to the consumer are unreliable.
pub fn process_query(root: &PacketRef, consumer: &mut dyn TupleConsumer) -> Result<()> {
    let qs = root.query_state().cloned().ok_or_else(|| {
        plan_err!(
            "packet '{}' has no query state, attach it with assign_query_state",
            root.name()
        )
    })?;
    info!(
        query_id = qs.id(),
        root = root.name(),
        policy = qs.policy().name(),
        "executing query"
    );

    if let Err(e) = deliver(root, &qs, consumer) {
        qs.fail(e);
    }
    qs.destroy();

    let progress = qs.progress().snapshot();
    match qs.take_error() {
        Some(e) => {
            info!(query_id = qs.id(), ?progress, %e, "query aborted");
            Err(e)
        }
        None => {
            info!(query_id = qs.id(), ?progress, "query finished");
            Ok(())
        }
    }
}

fn deliver(root: &PacketRef, qs: &Arc<QueryState>, consumer: &mut dyn TupleConsumer) -> Result<()> {
    let deadline = qs
        .config()
        .query_timeout()
        .map(|timeout| (Instant::now() + timeout, timeout));
    start_all(root, qs)?;
    consumer.begin()?;

    let output = root.output();
    loop {
        let tuple = match deadline {
            Some((at, timeout)) => match output.get_deadline(at)? {
                PollGet::Tuple(tuple) => tuple,
                PollGet::EndOfStream => break,
                PollGet::TimedOut => return Err(PipeError::Timeout(timeout)),
            },
            None => match output.get()? {
                Some(tuple) => tuple,
                None => break,
            },
        };
        qs.progress().add_tuples_delivered(1);
        consumer.process(&tuple)?;
    }

    Ok(())
}

use std::fmt::{self, Debug};
use std::sync::Arc;

use dyn_clone::DynClone;
use tuplepipe_error::{plan_err, Result};

use super::predicate::{Predicate, Projection};
use crate::tuple::Tuple;

/// Selection plus projection.
///
/// `project` is only called for tuples `select` accepted, with `dest` sized
/// to `output_size`.
pub trait Filter: Debug + Sync + Send + DynClone {
    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize {
        self.input_size()
    }

    fn select(&mut self, tuple: &Tuple) -> Result<bool>;

    fn project(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<()> {
        dest.assign(src)
    }

    /// Whether this filter will reject every further tuple. Lets a stage
    /// stop emitting early, e.g. after a top-K limit was reached.
    fn exhausted(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn Filter> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// Pass-through filter, accepts everything unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrivialFilter {
    pub tuple_size: usize,
}

impl TrivialFilter {
    pub const fn new(tuple_size: usize) -> Self {
        TrivialFilter { tuple_size }
    }
}

impl Filter for TrivialFilter {
    fn input_size(&self) -> usize {
        self.tuple_size
    }

    fn select(&mut self, _tuple: &Tuple) -> Result<bool> {
        Ok(true)
    }
}

/// Filter driven by a [`Predicate`] with a byte range [`Projection`].
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateFilter {
    input_size: usize,
    output_size: usize,
    predicate: Predicate,
    projection: Projection,
}

impl PredicateFilter {
    pub fn new(input_size: usize, predicate: Predicate, projection: Projection) -> Result<Self> {
        predicate.validate(input_size)?;
        projection.validate(input_size)?;
        Ok(PredicateFilter {
            input_size,
            output_size: projection.output_size(input_size),
            predicate,
            projection,
        })
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl Filter for PredicateFilter {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn select(&mut self, tuple: &Tuple) -> Result<bool> {
        self.predicate.evaluate(tuple)
    }

    fn project(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<()> {
        self.projection.apply(dest, src)
    }
}

/// Counting filter accepting only the first `limit` tuples it sees.
///
/// Each clone counts on its own, so a limit only holds globally on a single
/// worker stage such as sort emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitFilter {
    tuple_size: usize,
    limit: usize,
    seen: usize,
}

impl LimitFilter {
    pub const fn new(tuple_size: usize, limit: usize) -> Self {
        LimitFilter {
            tuple_size,
            limit,
            seen: 0,
        }
    }
}

impl Filter for LimitFilter {
    fn input_size(&self) -> usize {
        self.tuple_size
    }

    fn select(&mut self, _tuple: &Tuple) -> Result<bool> {
        if self.seen < self.limit {
            self.seen += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn exhausted(&self) -> bool {
        self.seen >= self.limit
    }
}

type SelectFn = dyn Fn(&Tuple) -> Result<bool> + Send + Sync;
type ProjectFn = dyn Fn(&mut Tuple, &Tuple) -> Result<()> + Send + Sync;

/// Filter built from closures.
#[derive(Clone)]
pub struct FnFilter {
    input_size: usize,
    output_size: usize,
    select: Arc<SelectFn>,
    project: Option<Arc<ProjectFn>>,
}

impl FnFilter {
    pub fn new<F>(tuple_size: usize, select: F) -> Self
    where
        F: Fn(&Tuple) -> Result<bool> + Send + Sync + 'static,
    {
        FnFilter {
            input_size: tuple_size,
            output_size: tuple_size,
            select: Arc::new(select),
            project: None,
        }
    }

    pub fn with_projection<F>(mut self, output_size: usize, project: F) -> Result<Self>
    where
        F: Fn(&mut Tuple, &Tuple) -> Result<()> + Send + Sync + 'static,
    {
        if output_size == 0 {
            return Err(plan_err!("projection output size must be non-zero"));
        }
        self.output_size = output_size;
        self.project = Some(Arc::new(project));
        Ok(self)
    }
}

impl Debug for FnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFilter")
            .field("input_size", &self.input_size)
            .field("output_size", &self.output_size)
            .finish_non_exhaustive()
    }
}

impl Filter for FnFilter {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn select(&mut self, tuple: &Tuple) -> Result<bool> {
        (self.select)(tuple)
    }

    fn project(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<()> {
        match &self.project {
            Some(project) => project(dest, src),
            None => dest.assign(src),
        }
    }
}

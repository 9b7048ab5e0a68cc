use std::fmt::{self, Debug};
use std::sync::Arc;

use dyn_clone::DynClone;
use tuplepipe_error::Result;

use crate::tuple::Tuple;

/// 1:1 transform that may drop tuples.
pub trait Sieve: Debug + Sync + Send + DynClone {
    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// Write the transformed `src` into `dest`. Returns false to drop it.
    fn pass(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<bool>;

    /// Called once after the input is exhausted. Returns true if `dest` holds
    /// a trailing tuple to emit.
    fn flush(&mut self, _dest: &mut Tuple) -> Result<bool> {
        Ok(false)
    }
}

impl Clone for Box<dyn Sieve> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

type PassFn = dyn Fn(&mut Tuple, &Tuple) -> Result<bool> + Send + Sync;

/// Sieve built from a closure.
#[derive(Clone)]
pub struct FnSieve {
    input_size: usize,
    output_size: usize,
    pass: Arc<PassFn>,
}

impl FnSieve {
    pub fn new<F>(input_size: usize, output_size: usize, pass: F) -> Self
    where
        F: Fn(&mut Tuple, &Tuple) -> Result<bool> + Send + Sync + 'static,
    {
        FnSieve {
            input_size,
            output_size,
            pass: Arc::new(pass),
        }
    }
}

impl Debug for FnSieve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSieve")
            .field("input_size", &self.input_size)
            .field("output_size", &self.output_size)
            .finish_non_exhaustive()
    }
}

impl Sieve for FnSieve {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn pass(&mut self, dest: &mut Tuple, src: &Tuple) -> Result<bool> {
        (self.pass)(dest, src)
    }
}

use std::fmt::Debug;

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use tuplepipe_error::{operator_err, plan_err, Result};

use crate::key::KeyExtractor;
use crate::tuple::schema::FieldType;
use crate::tuple::Tuple;

/// Group-by aggregation with incremental state.
///
/// A group's running state is a tuple of `state_size` bytes. The stage keeps
/// one state per distinct key (as decided by the attached comparator) and
/// hands it to `update` for every input tuple in that group.
pub trait Aggregate: Debug + Sync + Send + DynClone {
    fn key_extractor(&self) -> &KeyExtractor;

    fn input_size(&self) -> usize;

    fn state_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// Reset `state` for a new group.
    fn init(&mut self, state: &mut Tuple) -> Result<()> {
        state.clear();
        Ok(())
    }

    fn update(&mut self, state: &mut Tuple, tuple: &Tuple) -> Result<()>;

    /// Whether partial states from different workers can be merged.
    fn supports_merge(&self) -> bool {
        false
    }

    /// Fold `other` into `state`.
    fn merge(&mut self, _state: &mut Tuple, _other: &Tuple) -> Result<()> {
        Err(operator_err!("aggregate does not support merging partial states"))
    }

    /// Write the group's output tuple.
    fn finish(&mut self, dest: &mut Tuple, key: &[u8], state: &Tuple) -> Result<()>;
}

impl Clone for Box<dyn Aggregate> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// One aggregate computed by [`SimpleAggregate`].
///
/// Integer inputs accumulate as `i64`, float inputs as `f64`. `Count`
/// outputs an `i64`, `Avg` always outputs an `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateExpr {
    Count,
    Sum { offset: usize, ty: FieldType },
    Min { offset: usize, ty: FieldType },
    Max { offset: usize, ty: FieldType },
    Avg { offset: usize, ty: FieldType },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

fn read_num(tuple: &Tuple, offset: usize, ty: FieldType) -> Result<Num> {
    Ok(match ty {
        FieldType::Int32 => Num::Int(tuple.read_i32(offset)? as i64),
        FieldType::Int64 => Num::Int(tuple.read_i64(offset)?),
        FieldType::Float64 => Num::Float(tuple.read_f64(offset)?),
        FieldType::FixedBytes(_) => {
            return Err(operator_err!("cannot aggregate a byte string field"))
        }
    })
}

impl AggregateExpr {
    fn input(&self) -> Option<(usize, FieldType)> {
        match self {
            AggregateExpr::Count => None,
            AggregateExpr::Sum { offset, ty }
            | AggregateExpr::Min { offset, ty }
            | AggregateExpr::Max { offset, ty }
            | AggregateExpr::Avg { offset, ty } => Some((*offset, *ty)),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self.input(), Some((_, FieldType::Float64)))
            || matches!(self, AggregateExpr::Avg { .. })
    }

    fn init(&self, state: &mut Tuple, slot: usize) -> Result<()> {
        match self {
            AggregateExpr::Min { .. } if self.is_float() => state.write_f64(slot, f64::INFINITY),
            AggregateExpr::Min { .. } => state.write_i64(slot, i64::MAX),
            AggregateExpr::Max { .. } if self.is_float() => {
                state.write_f64(slot, f64::NEG_INFINITY)
            }
            AggregateExpr::Max { .. } => state.write_i64(slot, i64::MIN),
            _ if self.is_float() => state.write_f64(slot, 0.0),
            _ => state.write_i64(slot, 0),
        }
    }

    fn fold(&self, state: &mut Tuple, slot: usize, value: Num) -> Result<()> {
        match (self, value) {
            (AggregateExpr::Count, _) => {
                let count = state.read_i64(slot)?;
                state.write_i64(slot, count + 1)
            }
            (AggregateExpr::Min { .. }, Num::Int(v)) => {
                let cur = state.read_i64(slot)?;
                state.write_i64(slot, cur.min(v))
            }
            (AggregateExpr::Min { .. }, Num::Float(v)) => {
                let cur = state.read_f64(slot)?;
                state.write_f64(slot, cur.min(v))
            }
            (AggregateExpr::Max { .. }, Num::Int(v)) => {
                let cur = state.read_i64(slot)?;
                state.write_i64(slot, cur.max(v))
            }
            (AggregateExpr::Max { .. }, Num::Float(v)) => {
                let cur = state.read_f64(slot)?;
                state.write_f64(slot, cur.max(v))
            }
            (AggregateExpr::Avg { .. }, Num::Int(v)) => {
                let cur = state.read_f64(slot)?;
                state.write_f64(slot, cur + v as f64)
            }
            (_, Num::Int(v)) => {
                let cur = state.read_i64(slot)?;
                state.write_i64(slot, cur.wrapping_add(v))
            }
            (_, Num::Float(v)) => {
                let cur = state.read_f64(slot)?;
                state.write_f64(slot, cur + v)
            }
        }
    }

    /// Merge the partial slot in `other` into `state`.
    fn merge(&self, state: &mut Tuple, other: &Tuple, slot: usize) -> Result<()> {
        match self {
            AggregateExpr::Count => {
                let v = other.read_i64(slot)?;
                let cur = state.read_i64(slot)?;
                state.write_i64(slot, cur + v)
            }
            _ if self.is_float() => self.fold(state, slot, Num::Float(other.read_f64(slot)?)),
            _ => self.fold(state, slot, Num::Int(other.read_i64(slot)?)),
        }
    }

    fn finish(&self, dest: &mut Tuple, out: usize, state: &Tuple, slot: usize, rows: i64) -> Result<()> {
        match self {
            AggregateExpr::Avg { .. } => {
                let avg = if rows == 0 {
                    0.0
                } else {
                    state.read_f64(slot)? / rows as f64
                };
                dest.write_f64(out, avg)
            }
            AggregateExpr::Min { .. } | AggregateExpr::Max { .. } if rows == 0 => {
                dest.write_i64(out, 0)
            }
            _ => dest.write_bytes(out, state.bytes(slot, 8)?),
        }
    }
}

/// Aggregate computing a list of [`AggregateExpr`] per group.
///
/// Output layout is the key bytes followed by one 8 byte value per
/// expression. State layout is a row count followed by one 8 byte slot per
/// expression.
#[derive(Debug, Clone)]
pub struct SimpleAggregate {
    input_size: usize,
    key: KeyExtractor,
    exprs: Vec<AggregateExpr>,
}

impl SimpleAggregate {
    pub fn new(input_size: usize, key: KeyExtractor, exprs: Vec<AggregateExpr>) -> Result<Self> {
        key.validate(input_size)?;
        if exprs.is_empty() {
            return Err(plan_err!("aggregate needs at least one expression"));
        }
        for expr in &exprs {
            if let Some((offset, ty)) = expr.input() {
                if matches!(ty, FieldType::FixedBytes(_)) {
                    return Err(plan_err!("cannot aggregate byte string field at {offset}"));
                }
                match offset.checked_add(ty.width()) {
                    Some(end) if end <= input_size => (),
                    _ => {
                        return Err(plan_err!(
                            "aggregate input at {offset} exceeds tuple size {input_size}"
                        ))
                    }
                }
            }
        }

        Ok(SimpleAggregate {
            input_size,
            key,
            exprs,
        })
    }

    /// Global aggregate counting every input tuple.
    pub fn count(input_size: usize) -> Result<Self> {
        Self::new(input_size, KeyExtractor::empty(), vec![AggregateExpr::Count])
    }

    fn slot(idx: usize) -> usize {
        8 + idx * 8
    }
}

impl Aggregate for SimpleAggregate {
    fn key_extractor(&self) -> &KeyExtractor {
        &self.key
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn state_size(&self) -> usize {
        8 + self.exprs.len() * 8
    }

    fn output_size(&self) -> usize {
        self.key.key_len() + self.exprs.len() * 8
    }

    fn init(&mut self, state: &mut Tuple) -> Result<()> {
        state.write_i64(0, 0)?;
        for (idx, expr) in self.exprs.iter().enumerate() {
            expr.init(state, Self::slot(idx))?;
        }
        Ok(())
    }

    fn update(&mut self, state: &mut Tuple, tuple: &Tuple) -> Result<()> {
        let rows = state.read_i64(0)?;
        state.write_i64(0, rows + 1)?;
        for (idx, expr) in self.exprs.iter().enumerate() {
            let value = match expr.input() {
                Some((offset, ty)) => read_num(tuple, offset, ty)?,
                None => Num::Int(1),
            };
            expr.fold(state, Self::slot(idx), value)?;
        }
        Ok(())
    }

    fn supports_merge(&self) -> bool {
        true
    }

    fn merge(&mut self, state: &mut Tuple, other: &Tuple) -> Result<()> {
        let rows = state.read_i64(0)? + other.read_i64(0)?;
        state.write_i64(0, rows)?;
        for (idx, expr) in self.exprs.iter().enumerate() {
            expr.merge(state, other, Self::slot(idx))?;
        }
        Ok(())
    }

    fn finish(&mut self, dest: &mut Tuple, key: &[u8], state: &Tuple) -> Result<()> {
        dest.write_bytes(0, key)?;
        let rows = state.read_i64(0)?;
        let mut out = key.len();
        for (idx, expr) in self.exprs.iter().enumerate() {
            expr.finish(dest, out, state, Self::slot(idx), rows)?;
            out += 8;
        }
        Ok(())
    }
}

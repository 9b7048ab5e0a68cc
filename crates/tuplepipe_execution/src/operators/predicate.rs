use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tuplepipe_error::{plan_err, Result};

use crate::tuple::schema::{trim_padding, FieldType};
use crate::tuple::Tuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn matches(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::NotEq => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::LtEq => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// Constant operand of a scalar comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int32(i32),
    Int64(i64),
    Float64(f64),
}

impl Scalar {
    fn field_type(&self) -> FieldType {
        match self {
            Scalar::Int32(_) => FieldType::Int32,
            Scalar::Int64(_) => FieldType::Int64,
            Scalar::Float64(_) => FieldType::Float64,
        }
    }

    /// Compare the field at `offset` against this constant.
    fn compare_field(&self, tuple: &Tuple, offset: usize) -> Result<Option<Ordering>> {
        Ok(match self {
            Scalar::Int32(v) => Some(tuple.read_i32(offset)?.cmp(v)),
            Scalar::Int64(v) => Some(tuple.read_i64(offset)?.cmp(v)),
            Scalar::Float64(v) => tuple.read_f64(offset)?.partial_cmp(v),
        })
    }
}

/// Composable row predicate over fixed byte offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    True,
    /// Numeric field compared against a constant.
    Scalar {
        offset: usize,
        op: CompareOp,
        value: Scalar,
    },
    /// NUL padded string field compared against a constant.
    Bytes {
        offset: usize,
        len: usize,
        op: CompareOp,
        value: Vec<u8>,
    },
    /// SQL style LIKE with `%` wildcards.
    Like {
        offset: usize,
        len: usize,
        pattern: String,
        negated: bool,
    },
    /// Two fields of the same type compared against each other.
    Fields {
        left: usize,
        right: usize,
        ty: FieldType,
        op: CompareOp,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn scalar(offset: usize, op: CompareOp, value: Scalar) -> Self {
        Predicate::Scalar { offset, op, value }
    }

    pub fn bytes(offset: usize, len: usize, op: CompareOp, value: impl AsRef<[u8]>) -> Self {
        Predicate::Bytes {
            offset,
            len,
            op,
            value: value.as_ref().to_vec(),
        }
    }

    pub fn like(offset: usize, len: usize, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            offset,
            len,
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(offset: usize, len: usize, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            offset,
            len,
            pattern: pattern.into(),
            negated: true,
        }
    }

    /// Check every referenced field lies within `tuple_size` bytes.
    pub fn validate(&self, tuple_size: usize) -> Result<()> {
        let check = |offset: usize, len: usize| -> Result<()> {
            match offset.checked_add(len) {
                Some(end) if end <= tuple_size => Ok(()),
                _ => Err(plan_err!(
                    "predicate reads {len} bytes at offset {offset} of a {tuple_size} byte tuple"
                )),
            }
        };

        match self {
            Predicate::True => Ok(()),
            Predicate::Scalar { offset, value, .. } => check(*offset, value.field_type().width()),
            Predicate::Bytes { offset, len, .. } => check(*offset, *len),
            Predicate::Like {
                offset,
                len,
                pattern,
                ..
            } => {
                if pattern.is_empty() {
                    return Err(plan_err!("empty LIKE pattern"));
                }
                check(*offset, *len)
            }
            Predicate::Fields {
                left, right, ty, ..
            } => {
                check(*left, ty.width())?;
                check(*right, ty.width())
            }
            Predicate::And(preds) | Predicate::Or(preds) => {
                preds.iter().try_for_each(|p| p.validate(tuple_size))
            }
            Predicate::Not(pred) => pred.validate(tuple_size),
        }
    }

    pub fn evaluate(&self, tuple: &Tuple) -> Result<bool> {
        match self {
            Predicate::True => Ok(true),
            Predicate::Scalar { offset, op, value } => Ok(value
                .compare_field(tuple, *offset)?
                .is_some_and(|ord| op.matches(ord))),
            Predicate::Bytes {
                offset,
                len,
                op,
                value,
            } => {
                let field = trim_padding(tuple.bytes(*offset, *len)?);
                Ok(op.matches(field.cmp(trim_padding(value))))
            }
            Predicate::Like {
                offset,
                len,
                pattern,
                negated,
            } => {
                let field = trim_padding(tuple.bytes(*offset, *len)?);
                Ok(like_match(field, pattern.as_bytes()) != *negated)
            }
            Predicate::Fields {
                left,
                right,
                ty,
                op,
            } => {
                let ord = match ty {
                    FieldType::Int32 => Some(tuple.read_i32(*left)?.cmp(&tuple.read_i32(*right)?)),
                    FieldType::Int64 => Some(tuple.read_i64(*left)?.cmp(&tuple.read_i64(*right)?)),
                    FieldType::Float64 => tuple
                        .read_f64(*left)?
                        .partial_cmp(&tuple.read_f64(*right)?),
                    FieldType::FixedBytes(n) => {
                        Some(tuple.bytes(*left, *n)?.cmp(tuple.bytes(*right, *n)?))
                    }
                };
                Ok(ord.is_some_and(|ord| op.matches(ord)))
            }
            Predicate::And(preds) => {
                for pred in preds {
                    if !pred.evaluate(tuple)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(preds) => {
                for pred in preds {
                    if pred.evaluate(tuple)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(pred) => Ok(!pred.evaluate(tuple)?),
        }
    }
}

/// Match `value` against a pattern where `%` matches any run of bytes.
fn like_match(value: &[u8], pattern: &[u8]) -> bool {
    let parts: Vec<&[u8]> = pattern.split(|b| *b == b'%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];

    let Some(rest) = value.strip_prefix(first) else {
        return false;
    };
    if rest.len() < last.len() {
        return false;
    }
    let (mut middle, tail) = rest.split_at(rest.len() - last.len());
    if tail != last {
        return false;
    }

    for fragment in &parts[1..parts.len() - 1] {
        if fragment.is_empty() {
            continue;
        }
        match middle
            .windows(fragment.len())
            .position(|window| window == *fragment)
        {
            Some(pos) => middle = &middle[pos + fragment.len()..],
            None => return false,
        }
    }

    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: usize,
    pub len: usize,
}

impl ByteRange {
    pub const fn new(offset: usize, len: usize) -> Self {
        ByteRange { offset, len }
    }
}

/// Reshapes a selected tuple into the output layout.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Projection {
    #[default]
    Identity,
    /// Copy each range, in order, contiguously into the output.
    Ranges(Vec<ByteRange>),
}

impl Projection {
    pub fn output_size(&self, input_size: usize) -> usize {
        match self {
            Projection::Identity => input_size,
            Projection::Ranges(ranges) => ranges.iter().map(|r| r.len).sum(),
        }
    }

    pub fn validate(&self, input_size: usize) -> Result<()> {
        if let Projection::Ranges(ranges) = self {
            if ranges.is_empty() {
                return Err(plan_err!("projection must select at least one range"));
            }
            for r in ranges {
                match r.offset.checked_add(r.len) {
                    Some(end) if end <= input_size => (),
                    _ => {
                        return Err(plan_err!(
                            "projected range {}..{} exceeds input tuple size {input_size}",
                            r.offset,
                            r.offset.saturating_add(r.len)
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    pub fn apply(&self, dest: &mut Tuple, src: &Tuple) -> Result<()> {
        match self {
            Projection::Identity => dest.assign(src),
            Projection::Ranges(ranges) => {
                let mut out = 0;
                for r in ranges {
                    dest.write_bytes(out, src.bytes(r.offset, r.len)?)?;
                    out += r.len;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::schema::{TupleSchema, Value};

    fn part_schema() -> TupleSchema {
        TupleSchema::builder()
            .int32("p_partkey")
            .fixed_bytes("p_type", 16)
            .float64("p_price")
            .float64("p_cost")
            .build()
    }

    fn part(key: i32, ty: &str, price: f64, cost: f64) -> Tuple {
        part_schema()
            .encode(&[
                Value::Int32(key),
                Value::bytes(ty),
                Value::Float64(price),
                Value::Float64(cost),
            ])
            .unwrap()
    }

    #[test]
    fn like_patterns() {
        assert!(like_match(b"PROMO BRUSHED", b"PROMO%"));
        assert!(!like_match(b"STANDARD PROMO", b"PROMO%"));
        assert!(like_match(b"forest green", b"%green"));
        assert!(like_match(b"special requests here", b"%special%requests%"));
        assert!(!like_match(b"requests special", b"%special%requests%"));
        assert!(like_match(b"abc", b"abc"));
        assert!(!like_match(b"abcd", b"abc"));
        // Prefix and suffix may not overlap.
        assert!(!like_match(b"aba", b"ab%ba"));
        assert!(like_match(b"abba", b"ab%ba"));
    }

    #[test]
    fn compound_predicates() {
        let schema = part_schema();
        let price = schema.offset_of("p_price").unwrap();
        let ty = schema.field("p_type").unwrap();

        let pred = Predicate::And(vec![
            Predicate::scalar(price, CompareOp::Gt, Scalar::Float64(10.0)),
            Predicate::Or(vec![
                Predicate::like(ty.offset, 16, "PROMO%"),
                Predicate::bytes(ty.offset, 16, CompareOp::Eq, "LARGE BOX"),
            ]),
        ]);
        pred.validate(schema.tuple_size()).unwrap();

        assert!(pred.evaluate(&part(1, "PROMO TIN", 11.0, 1.0)).unwrap());
        assert!(pred.evaluate(&part(2, "LARGE BOX", 11.0, 1.0)).unwrap());
        assert!(!pred.evaluate(&part(3, "SMALL BOX", 11.0, 1.0)).unwrap());
        assert!(!pred.evaluate(&part(4, "PROMO TIN", 9.0, 1.0)).unwrap());

        let negated = Predicate::Not(Box::new(pred));
        assert!(negated.evaluate(&part(4, "PROMO TIN", 9.0, 1.0)).unwrap());
    }

    #[test]
    fn field_to_field() {
        let schema = part_schema();
        let pred = Predicate::Fields {
            left: schema.offset_of("p_price").unwrap(),
            right: schema.offset_of("p_cost").unwrap(),
            ty: FieldType::Float64,
            op: CompareOp::LtEq,
        };
        assert!(pred.evaluate(&part(1, "X", 1.0, 2.0)).unwrap());
        assert!(!pred.evaluate(&part(1, "X", 3.0, 2.0)).unwrap());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let pred = Predicate::scalar(30, CompareOp::Eq, Scalar::Int64(1));
        assert!(pred.validate(32).is_err());
        assert!(Predicate::like(0, 4, "").validate(8).is_err());
        assert!(Predicate::Not(Box::new(pred)).validate(38).is_ok());
    }

    #[test]
    fn range_projection() {
        let schema = part_schema();
        let proj = Projection::Ranges(vec![ByteRange::new(20, 8), ByteRange::new(0, 4)]);
        proj.validate(schema.tuple_size()).unwrap();
        assert_eq!(12, proj.output_size(schema.tuple_size()));

        let mut dest = Tuple::zeroed(12);
        proj.apply(&mut dest, &part(9, "X", 4.5, 0.0)).unwrap();
        assert_eq!(4.5, dest.read_f64(0).unwrap());
        assert_eq!(9, dest.read_i32(8).unwrap());

        assert!(Projection::Ranges(vec![ByteRange::new(30, 8)])
            .validate(schema.tuple_size())
            .is_err());
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use tuplepipe_error::{plan_err, PipeError, Result};

use super::Tuple;
use crate::key::KeyExtractor;

/// Physical type of a field within a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int32,
    Int64,
    Float64,
    /// Fixed width byte string, NUL padded.
    FixedBytes(usize),
}

impl FieldType {
    pub const fn width(&self) -> usize {
        match self {
            FieldType::Int32 => 4,
            FieldType::Int64 => 8,
            FieldType::Float64 => 8,
            FieldType::FixedBytes(n) => *n,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int32 => write!(f, "INT32"),
            FieldType::Int64 => write!(f, "INT64"),
            FieldType::Float64 => write!(f, "FLOAT64"),
            FieldType::FixedBytes(n) => write!(f, "BYTES({n})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Value::Bytes(b.as_ref().to_vec())
    }

    /// Interpret a bytes value as a string, ignoring NUL padding.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(trim_padding(b)).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Strip trailing NUL padding from a fixed width byte field.
pub fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map(|p| p + 1).unwrap_or(0);
    &bytes[..end]
}

/// Describes the byte layout of every tuple in a stream.
///
/// Fields are laid out contiguously in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TupleSchema {
    fields: Vec<Field>,
    tuple_size: usize,
}

impl TupleSchema {
    pub fn builder() -> TupleSchemaBuilder {
        TupleSchemaBuilder::default()
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| plan_err!("missing field '{name}'"))
    }

    pub fn field_at(&self, idx: usize) -> Result<&Field> {
        self.fields.get(idx).ok_or_else(|| {
            plan_err!(
                "field index {idx} out of range for schema with {} fields",
                self.fields.len()
            )
        })
    }

    pub fn offset_of(&self, name: &str) -> Result<usize> {
        Ok(self.field(name)?.offset)
    }

    /// Key extractor covering exactly the bytes of the named field.
    pub fn key_range(&self, name: &str) -> Result<KeyExtractor> {
        let field = self.field(name)?;
        Ok(KeyExtractor::range(field.offset, field.ty.width()))
    }

    /// Concatenate two schemas, as produced by a join combining a left and
    /// right tuple back to back.
    pub fn concat(&self, other: &TupleSchema) -> TupleSchema {
        let mut builder = TupleSchemaBuilder::default();
        for field in self.fields.iter().chain(other.fields.iter()) {
            builder = builder.field(field.name.clone(), field.ty);
        }
        builder.build()
    }

    /// Encode values into a new tuple.
    pub fn encode(&self, values: &[Value]) -> Result<Tuple> {
        if values.len() != self.fields.len() {
            return Err(PipeError::Operator(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }

        let mut tuple = Tuple::zeroed(self.tuple_size);
        for (field, value) in self.fields.iter().zip(values) {
            match (field.ty, value) {
                (FieldType::Int32, Value::Int32(v)) => tuple.write_i32(field.offset, *v)?,
                (FieldType::Int64, Value::Int64(v)) => tuple.write_i64(field.offset, *v)?,
                (FieldType::Float64, Value::Float64(v)) => tuple.write_f64(field.offset, *v)?,
                (FieldType::FixedBytes(width), Value::Bytes(b)) => {
                    if b.len() > width {
                        return Err(PipeError::Operator(format!(
                            "value for '{}' is {} bytes, field holds {width}",
                            field.name,
                            b.len()
                        )));
                    }
                    tuple.write_bytes(field.offset, b)?
                }
                (ty, value) => {
                    return Err(PipeError::Operator(format!(
                        "cannot encode {value:?} into {ty} field '{}'",
                        field.name
                    )))
                }
            }
        }

        Ok(tuple)
    }

    /// Decode every field of a tuple.
    pub fn decode(&self, tuple: &Tuple) -> Result<Vec<Value>> {
        self.fields
            .iter()
            .map(|field| decode_field(field, tuple))
            .collect()
    }

    pub fn decode_field(&self, name: &str, tuple: &Tuple) -> Result<Value> {
        decode_field(self.field(name)?, tuple)
    }
}

fn decode_field(field: &Field, tuple: &Tuple) -> Result<Value> {
    Ok(match field.ty {
        FieldType::Int32 => Value::Int32(tuple.read_i32(field.offset)?),
        FieldType::Int64 => Value::Int64(tuple.read_i64(field.offset)?),
        FieldType::Float64 => Value::Float64(tuple.read_f64(field.offset)?),
        FieldType::FixedBytes(n) => Value::Bytes(tuple.bytes(field.offset, n)?.to_vec()),
    })
}

#[derive(Debug, Default)]
pub struct TupleSchemaBuilder {
    fields: Vec<Field>,
    offset: usize,
}

impl TupleSchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
            offset: self.offset,
        });
        self.offset += ty.width();
        self
    }

    pub fn int32(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Int32)
    }

    pub fn int64(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Int64)
    }

    pub fn float64(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Float64)
    }

    pub fn fixed_bytes(self, name: impl Into<String>, width: usize) -> Self {
        self.field(name, FieldType::FixedBytes(width))
    }

    pub fn build(self) -> TupleSchema {
        TupleSchema {
            fields: self.fields,
            tuple_size: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nation() -> TupleSchema {
        TupleSchema::builder()
            .int32("n_nationkey")
            .fixed_bytes("n_name", 8)
            .float64("n_balance")
            .build()
    }

    #[test]
    fn layout_is_contiguous() {
        let schema = nation();
        assert_eq!(20, schema.tuple_size());
        assert_eq!(0, schema.offset_of("n_nationkey").unwrap());
        assert_eq!(4, schema.offset_of("n_name").unwrap());
        assert_eq!(12, schema.offset_of("n_balance").unwrap());
        assert!(schema.offset_of("n_comment").is_err());
    }

    #[test]
    fn encode_decode_with_padding() {
        let schema = nation();
        let tuple = schema
            .encode(&[Value::Int32(3), Value::bytes("CANADA"), Value::Float64(1.5)])
            .unwrap();
        assert_eq!(20, tuple.size());

        let values = schema.decode(&tuple).unwrap();
        assert_eq!(Value::Int32(3), values[0]);
        assert_eq!(Some("CANADA"), values[1].as_str());
        assert_eq!(Value::Float64(1.5), values[2]);
    }

    #[test]
    fn encode_rejects_mismatches() {
        let schema = nation();
        assert!(schema.encode(&[Value::Int32(3)]).is_err());
        assert!(schema
            .encode(&[Value::Int64(3), Value::bytes("X"), Value::Float64(0.0)])
            .is_err());
        assert!(schema
            .encode(&[Value::Int32(3), Value::bytes("TOO LONG NAME"), Value::Float64(0.0)])
            .is_err());
    }

    #[test]
    fn concat_shifts_offsets() {
        let left = TupleSchema::builder().int32("a").build();
        let right = TupleSchema::builder().int64("b").build();
        let joined = left.concat(&right);
        assert_eq!(12, joined.tuple_size());
        assert_eq!(4, joined.offset_of("b").unwrap());
    }
}

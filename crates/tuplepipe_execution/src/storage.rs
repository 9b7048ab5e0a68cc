//! Interface to the storage layer feeding scan stages.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tuplepipe_error::{PipeError, Result};

use crate::tuple::schema::{TupleSchema, Value};
use crate::tuple::Tuple;

/// Transaction a scan reads under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionContext {
    pub txn_id: u64,
}

impl TransactionContext {
    pub const fn new(txn_id: u64) -> Self {
        TransactionContext { txn_id }
    }
}

/// Lazy, finite sequence of raw rows. Not restartable, a fresh scan reopens
/// the table.
pub trait Cursor: Send {
    fn next(&mut self) -> Result<Option<Tuple>>;
}

pub trait Table: Debug + Sync + Send {
    fn name(&self) -> &str;

    fn schema(&self) -> &TupleSchema;

    fn row_size(&self) -> usize {
        self.schema().tuple_size()
    }

    fn open_scan(&self, txn: &TransactionContext) -> Result<Box<dyn Cursor>>;

    /// Copy column `column` of `row` into `out`, which must match the
    /// column's width.
    fn decode_column(&self, row: &Tuple, column: usize, out: &mut [u8]) -> Result<()> {
        let field = self
            .schema()
            .field_at(column)
            .map_err(|e| PipeError::Scan(e.to_string()))?;
        if out.len() != field.ty.width() {
            return Err(PipeError::Scan(format!(
                "column '{}' is {} bytes, output buffer holds {}",
                field.name,
                field.ty.width(),
                out.len()
            )));
        }
        let bytes = row.bytes(field.offset, out.len()).map_err(|_| {
            PipeError::Scan(format!(
                "row of {} bytes too short for column '{}' in table '{}'",
                row.size(),
                field.name,
                self.name()
            ))
        })?;
        out.copy_from_slice(bytes);
        Ok(())
    }
}

/// Table held entirely in memory.
///
/// Rows are shared with open cursors, inserts after a scan opened aren't
/// visible to that scan.
#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    schema: TupleSchema,
    rows: RwLock<Arc<Vec<Tuple>>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>, schema: TupleSchema) -> Self {
        MemoryTable {
            name: name.into(),
            schema,
            rows: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn insert(&self, values: &[Value]) -> Result<()> {
        let row = self.schema.encode(values)?;
        self.insert_raw(row);
        Ok(())
    }

    /// Insert a row without checking it against the schema.
    pub fn insert_raw(&self, row: Tuple) {
        let mut rows = self.rows.write();
        Arc::make_mut(&mut *rows).push(row);
    }

    pub fn num_rows(&self) -> usize {
        self.rows.read().len()
    }
}

impl Table for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    fn open_scan(&self, _txn: &TransactionContext) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MemoryCursor {
            table: self.name.clone(),
            row_size: self.schema.tuple_size(),
            rows: self.rows.read().clone(),
            idx: 0,
        }))
    }
}

#[derive(Debug)]
struct MemoryCursor {
    table: String,
    row_size: usize,
    rows: Arc<Vec<Tuple>>,
    idx: usize,
}

impl Cursor for MemoryCursor {
    fn next(&mut self) -> Result<Option<Tuple>> {
        let Some(row) = self.rows.get(self.idx) else {
            return Ok(None);
        };
        self.idx += 1;
        if row.size() != self.row_size {
            return Err(PipeError::Scan(format!(
                "row {} of table '{}' has {} bytes, expected {}",
                self.idx - 1,
                self.table,
                row.size(),
                self.row_size
            )));
        }
        Ok(Some(row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MemoryTable {
        let schema = TupleSchema::builder().int32("a").int64("b").build();
        let table = MemoryTable::new("t", schema);
        table.insert(&[Value::Int32(1), Value::Int64(10)]).unwrap();
        table.insert(&[Value::Int32(2), Value::Int64(20)]).unwrap();
        table
    }

    #[test]
    fn scan_yields_rows_in_order() {
        let table = table();
        let mut cursor = table.open_scan(&TransactionContext::default()).unwrap();
        let mut out = Vec::new();
        while let Some(row) = cursor.next().unwrap() {
            out.push(row.read_i32(0).unwrap());
        }
        assert_eq!(vec![1, 2], out);
        assert_eq!(None, cursor.next().unwrap());
    }

    #[test]
    fn scan_snapshot_isolated_from_inserts() {
        let table = table();
        let mut cursor = table.open_scan(&TransactionContext::new(1)).unwrap();
        table.insert(&[Value::Int32(3), Value::Int64(30)]).unwrap();

        let mut count = 0;
        while cursor.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(2, count);
        assert_eq!(3, table.num_rows());
    }

    #[test]
    fn short_row_is_scan_error() {
        let table = table();
        table.insert_raw(Tuple::from_bytes(vec![1, 2, 3]));
        let mut cursor = table.open_scan(&TransactionContext::default()).unwrap();
        cursor.next().unwrap();
        cursor.next().unwrap();
        assert!(matches!(cursor.next(), Err(PipeError::Scan(_))));
    }

    #[test]
    fn decode_column_copies_field() {
        let table = table();
        let row = table.schema().encode(&[Value::Int32(5), Value::Int64(-4)]).unwrap();
        let mut out = [0u8; 8];
        table.decode_column(&row, 1, &mut out).unwrap();
        assert_eq!(-4, i64::from_le_bytes(out));

        let mut wrong = [0u8; 4];
        assert!(table.decode_column(&row, 1, &mut wrong).is_err());
        assert!(table
            .decode_column(&Tuple::zeroed(6), 1, &mut out)
            .is_err());
    }
}

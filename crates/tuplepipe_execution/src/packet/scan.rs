use std::sync::Arc;

use tracing::debug;
use tuplepipe_error::{plan_err, PipeError, Result};

use super::filter_project::emit_filtered;
use super::{Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::operators::Filter;
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::storage::{Table, TransactionContext};

/// Rows between cancellation checks when the filter rejects everything.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug)]
pub struct ScanStage {
    table: Arc<dyn Table>,
    txn: TransactionContext,
    filter: Box<dyn Filter>,
}

impl Packet {
    /// Stream every row of `table` through `filter`.
    pub fn scan(
        name: impl Into<String>,
        opts: BufferOptions,
        table: Arc<dyn Table>,
        txn: TransactionContext,
        filter: Box<dyn Filter>,
    ) -> Result<PacketRef> {
        let name = name.into();
        if filter.input_size() != table.row_size() {
            return Err(plan_err!(
                "'{name}' filter expects {} byte rows but table '{}' has {} byte rows",
                filter.input_size(),
                table.name(),
                table.row_size()
            ));
        }
        let output_size = filter.output_size();
        Packet::build(
            name,
            output_size,
            opts,
            Vec::new(),
            PacketKind::Scan(ScanStage { table, txn, filter }),
        )
    }
}

impl ScanStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let stage = packet.stage_info(StageKind::Scan, false, qs);
        let output = packet.output().clone();

        packet.spawn_producers(qs, &stage, |_, _| {
            let table = self.table.clone();
            let txn = self.txn;
            let filter = self.filter.clone();
            let output = output.clone();
            let qs = qs.clone();
            move || run_scan(&qs, table.as_ref(), &txn, filter, &output)
        })
    }
}

fn run_scan(
    qs: &QueryState,
    table: &dyn Table,
    txn: &TransactionContext,
    mut filter: Box<dyn Filter>,
    output: &TupleBuffer,
) -> Result<()> {
    let mut cursor = table.open_scan(txn)?;
    let row_size = table.row_size();
    let mut scanned = 0;

    while let Some(row) = cursor.next()? {
        if row.size() != row_size {
            return Err(PipeError::Scan(format!(
                "cursor of table '{}' returned a {} byte row, expected {row_size}",
                table.name(),
                row.size()
            )));
        }
        scanned += 1;
        if scanned % CANCEL_CHECK_INTERVAL == 0 {
            qs.progress().add_rows_scanned(CANCEL_CHECK_INTERVAL);
            qs.check_running()?;
        }
        if !emit_filtered(filter.as_mut(), output, &row)? || filter.exhausted() {
            break;
        }
    }
    qs.progress().add_rows_scanned(scanned % CANCEL_CHECK_INTERVAL);

    debug!(table = table.name(), scanned, stats = ?output.stats(), "scan finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{FnFilter, LimitFilter, TrivialFilter};
    use crate::packet::testutil::*;
    use crate::storage::{Cursor, MemoryTable};
    use crate::tuple::schema::TupleSchema;
    use crate::tuple::Tuple;

    /// Table whose cursor hands out rows as stored, without checking them.
    #[derive(Debug)]
    struct RaggedTable {
        schema: TupleSchema,
        rows: Vec<Tuple>,
    }

    struct RaggedCursor(std::vec::IntoIter<Tuple>);

    impl Cursor for RaggedCursor {
        fn next(&mut self) -> Result<Option<Tuple>> {
            Ok(self.0.next())
        }
    }

    impl Table for RaggedTable {
        fn name(&self) -> &str {
            "ragged"
        }

        fn schema(&self) -> &TupleSchema {
            &self.schema
        }

        fn open_scan(&self, _txn: &TransactionContext) -> Result<Box<dyn Cursor>> {
            Ok(Box::new(RaggedCursor(self.rows.clone().into_iter())))
        }
    }

    fn ragged_scan(bad_row: Tuple) -> PacketRef {
        let table = RaggedTable {
            schema: TupleSchema::builder().int32("k").int32("v").build(),
            rows: vec![Tuple::zeroed(8), bad_row],
        };
        let filter = FnFilter::new(8, |_| Ok(true))
            .with_projection(4, |dest, src| dest.write_i32(0, src.read_i32(0)?))
            .unwrap();
        Packet::scan(
            "scan",
            BufferOptions::default(),
            Arc::new(table),
            TransactionContext::default(),
            Box::new(filter),
        )
        .unwrap()
    }

    #[test]
    fn scans_all_rows() {
        let rows = [(1, 1), (2, 4), (3, 9)];
        let scan = kv_scan("scan", &rows);
        assert_eq!(rows.to_vec(), pairs(&run(&scan).unwrap()));
    }

    #[test]
    fn filter_row_size_must_match_table() {
        let res = Packet::scan(
            "scan",
            BufferOptions::default(),
            kv_table(&[]),
            TransactionContext::default(),
            Box::new(TrivialFilter::new(4)),
        );
        assert!(res.is_err());
    }

    #[test]
    fn exhausted_filter_stops_scan() {
        let rows: Vec<_> = (0..100).map(|i| (i, i)).collect();
        let scan = Packet::scan(
            "scan",
            BufferOptions::with_capacity(2),
            kv_table(&rows),
            TransactionContext::default(),
            Box::new(LimitFilter::new(8, 5)),
        )
        .unwrap();
        assert_eq!(rows[..5].to_vec(), pairs(&run(&scan).unwrap()));
    }

    #[test]
    fn projection_changes_output_size() {
        let filter = FnFilter::new(8, |_| Ok(true))
            .with_projection(4, |dest, src| dest.write_i32(0, src.read_i32(4)? * 10))
            .unwrap();
        let scan = Packet::scan(
            "scan",
            BufferOptions::default(),
            kv_table(&[(1, 2), (3, 4)]),
            TransactionContext::default(),
            Box::new(filter),
        )
        .unwrap();

        let out: Vec<_> = run(&scan)
            .unwrap()
            .iter()
            .map(|t| t.read_i32(0).unwrap())
            .collect();
        assert_eq!(vec![20, 40], out);
    }

    #[test]
    fn corrupt_row_fails_query() {
        let schema = TupleSchema::builder().int32("k").int32("v").build();
        let table = MemoryTable::new("corrupt", schema);
        table.insert_raw(Tuple::zeroed(8));
        table.insert_raw(Tuple::zeroed(3));
        let scan = Packet::scan(
            "scan",
            BufferOptions::default(),
            Arc::new(table),
            TransactionContext::default(),
            Box::new(TrivialFilter::new(8)),
        )
        .unwrap();

        assert!(matches!(
            run(&scan),
            Err(tuplepipe_error::PipeError::Scan(_))
        ));
    }

    #[test]
    fn row_size_mismatch_from_cursor() {
        for bad_row in [Tuple::zeroed(3), Tuple::zeroed(12)] {
            assert!(matches!(
                run(&ragged_scan(bad_row)),
                Err(tuplepipe_error::PipeError::Scan(_))
            ));
        }
    }
}

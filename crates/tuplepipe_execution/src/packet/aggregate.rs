use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;
use tuplepipe_error::{plan_err, Result};

use super::{check_input_size, Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::key::{compare_keys, KeyComparator};
use crate::operators::Aggregate;
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::tuple::Tuple;

/// Group states keyed by the extracted key bytes.
type GroupTable = HashMap<Vec<u8>, Tuple, RandomState>;

#[derive(Debug)]
pub struct AggregateStage {
    aggregate: Box<dyn Aggregate>,
    comparator: Arc<dyn KeyComparator>,
}

#[derive(Debug)]
pub struct PartialAggregateStage {
    aggregate: Box<dyn Aggregate>,
}

fn check_aggregate(name: &str, input: &Packet, aggregate: &dyn Aggregate) -> Result<()> {
    check_input_size(name, input, aggregate.input_size())?;
    aggregate
        .key_extractor()
        .validate(aggregate.input_size())
        .map_err(|e| plan_err!("'{name}' group key: {e}"))?;
    if aggregate.state_size() == 0 || aggregate.output_size() == 0 {
        return Err(plan_err!("'{name}' aggregate state and output must be non-empty"));
    }
    Ok(())
}

impl Packet {
    /// Aggregate over input ordered by the group key.
    ///
    /// Adjacent tuples comparing equal under `comparator` form one group, a
    /// group is emitted as soon as the next one starts. A global aggregate
    /// (zero length key) emits one tuple even for empty input.
    pub fn aggregate(
        name: impl Into<String>,
        opts: BufferOptions,
        input: PacketRef,
        aggregate: Box<dyn Aggregate>,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<PacketRef> {
        let name = name.into();
        check_aggregate(&name, &input, aggregate.as_ref())?;
        let output_size = aggregate.output_size();
        Packet::build(
            name,
            output_size,
            opts,
            vec![input],
            PacketKind::Aggregate(AggregateStage {
                aggregate,
                comparator,
            }),
        )
    }

    /// Hash aggregate over unordered input, groups are keyed by the exact
    /// key bytes.
    ///
    /// Runs several workers with private tables when the aggregate can merge
    /// partial states, the last worker to finish merges and emits.
    pub fn partial_aggregate(
        name: impl Into<String>,
        opts: BufferOptions,
        input: PacketRef,
        aggregate: Box<dyn Aggregate>,
    ) -> Result<PacketRef> {
        let name = name.into();
        check_aggregate(&name, &input, aggregate.as_ref())?;
        let output_size = aggregate.output_size();
        Packet::build(
            name,
            output_size,
            opts,
            vec![input],
            PacketKind::PartialAggregate(PartialAggregateStage { aggregate }),
        )
    }
}

impl AggregateStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let stage = packet.stage_info(StageKind::Aggregate, false, qs);
        let input = packet.input(0).output().clone();
        let output = packet.output().clone();

        packet.spawn_producers(qs, &stage, |_, _| {
            let input = input.clone();
            let output = output.clone();
            let aggregate = self.aggregate.clone();
            let comparator = self.comparator.clone();
            move || run_sorted_aggregate(&input, &output, aggregate, comparator.as_ref())
        })
    }
}

fn new_state(aggregate: &mut dyn Aggregate, tuple: Option<&Tuple>) -> Result<Tuple> {
    let mut state = Tuple::zeroed(aggregate.state_size());
    aggregate.init(&mut state)?;
    if let Some(tuple) = tuple {
        aggregate.update(&mut state, tuple)?;
    }
    Ok(state)
}

fn emit_group(
    aggregate: &mut dyn Aggregate,
    output: &TupleBuffer,
    key: &[u8],
    state: &Tuple,
) -> Result<bool> {
    let mut dest = Tuple::zeroed(aggregate.output_size());
    aggregate.finish(&mut dest, key, state)?;
    output.put(dest)
}

fn run_sorted_aggregate(
    input: &TupleBuffer,
    output: &TupleBuffer,
    mut aggregate: Box<dyn Aggregate>,
    comparator: &dyn KeyComparator,
) -> Result<()> {
    let extractor = aggregate.key_extractor().clone();
    let mut current: Option<(Vec<u8>, Tuple)> = None;
    let mut groups = 0usize;

    while let Some(tuple) = input.get()? {
        let key = extractor.extract(&tuple)?;
        let same_group = match &current {
            Some((current_key, _)) => {
                compare_keys(comparator, current_key, &key) == CmpOrdering::Equal
            }
            None => false,
        };

        if same_group {
            if let Some((_, state)) = current.as_mut() {
                aggregate.update(state, &tuple)?;
            }
            continue;
        }

        if let Some((group_key, state)) = current.take() {
            groups += 1;
            if !emit_group(aggregate.as_mut(), output, &group_key, &state)? {
                input.detach_consumer();
                return Ok(());
            }
        }
        let state = new_state(aggregate.as_mut(), Some(&tuple))?;
        current = Some((key.into_owned(), state));
    }

    match current {
        Some((group_key, state)) => {
            groups += 1;
            emit_group(aggregate.as_mut(), output, &group_key, &state)?;
        }
        None if extractor.key_len() == 0 => {
            groups += 1;
            let state = new_state(aggregate.as_mut(), None)?;
            emit_group(aggregate.as_mut(), output, &[], &state)?;
        }
        None => (),
    }

    debug!(buffer = input.name(), groups, "aggregate finished");
    Ok(())
}

/// Tables handed in by finished partial aggregate workers.
#[derive(Debug)]
struct PartialTables {
    tables: Mutex<Vec<GroupTable>>,
    remaining: AtomicUsize,
}

impl PartialAggregateStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let replicable = self.aggregate.supports_merge();
        let stage = packet.stage_info(StageKind::PartialAggregate, replicable, qs);
        let input = packet.input(0).output().clone();
        let output = packet.output().clone();
        let mut shared: Option<Arc<PartialTables>> = None;

        packet.spawn_producers(qs, &stage, |_, workers| {
            let shared = shared
                .get_or_insert_with(|| {
                    Arc::new(PartialTables {
                        tables: Mutex::new(Vec::with_capacity(workers)),
                        remaining: AtomicUsize::new(workers),
                    })
                })
                .clone();
            let input = input.clone();
            let output = output.clone();
            let aggregate = self.aggregate.clone();
            move || run_partial_aggregate(&input, &output, aggregate, &shared)
        })
    }
}

fn run_partial_aggregate(
    input: &TupleBuffer,
    output: &TupleBuffer,
    mut aggregate: Box<dyn Aggregate>,
    shared: &PartialTables,
) -> Result<()> {
    let extractor = aggregate.key_extractor().clone();
    let mut table = GroupTable::with_hasher(RandomState::new());

    while let Some(tuple) = input.get()? {
        let key = extractor.extract(&tuple)?;
        match table.get_mut(&*key) {
            Some(state) => aggregate.update(state, &tuple)?,
            None => {
                let state = new_state(aggregate.as_mut(), Some(&tuple))?;
                table.insert(key.into_owned(), state);
            }
        }
    }

    shared.tables.lock().push(table);
    if shared.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        // Another worker is still running and will emit.
        return Ok(());
    }

    let mut tables = std::mem::take(&mut *shared.tables.lock());
    let mut merged = tables.pop().unwrap_or_default();
    for table in tables {
        for (key, state) in table {
            match merged.get_mut(&key) {
                Some(existing) => aggregate.merge(existing, &state)?,
                None => {
                    merged.insert(key, state);
                }
            }
        }
    }

    if merged.is_empty() && extractor.key_len() == 0 {
        let state = new_state(aggregate.as_mut(), None)?;
        merged.insert(Vec::new(), state);
    }

    let groups = merged.len();
    for (key, state) in merged {
        if !emit_group(aggregate.as_mut(), output, &key, &state)? {
            input.detach_consumer();
            break;
        }
    }
    debug!(buffer = input.name(), groups, "partial aggregate finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytesComparator, Int32Comparator, KeyExtractor};
    use crate::operators::{AggregateExpr, SimpleAggregate};
    use crate::packet::testutil::*;
    use crate::tuple::schema::FieldType;

    fn sum_by_key() -> Box<dyn Aggregate> {
        Box::new(
            SimpleAggregate::new(
                8,
                KeyExtractor::range(0, 4),
                vec![
                    AggregateExpr::Count,
                    AggregateExpr::Sum {
                        offset: 4,
                        ty: FieldType::Int32,
                    },
                ],
            )
            .unwrap(),
        )
    }

    /// (key, count, sum) triples.
    fn groups(tuples: &[Tuple]) -> Vec<(i32, i64, i64)> {
        let mut out: Vec<_> = tuples
            .iter()
            .map(|t| {
                (
                    t.read_i32(0).unwrap(),
                    t.read_i64(4).unwrap(),
                    t.read_i64(12).unwrap(),
                )
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn sorted_groups() {
        let scan = kv_scan("scan", &[(1, 10), (1, 5), (2, 7), (3, 1), (3, 2)]);
        let agg = Packet::aggregate(
            "agg",
            BufferOptions::default(),
            scan,
            sum_by_key(),
            Arc::new(Int32Comparator::asc()),
        )
        .unwrap();

        assert_eq!(
            vec![(1, 2, 15), (2, 1, 7), (3, 2, 3)],
            groups(&run(&agg).unwrap())
        );
    }

    #[test]
    fn global_count_over_empty_input() {
        let scan = kv_scan("scan", &[]);
        let agg = Packet::aggregate(
            "count",
            BufferOptions::default(),
            scan,
            Box::new(SimpleAggregate::count(8).unwrap()),
            Arc::new(BytesComparator),
        )
        .unwrap();

        let out = run(&agg).unwrap();
        assert_eq!(1, out.len());
        assert_eq!(0, out[0].read_i64(0).unwrap());
    }

    #[test]
    fn keyed_aggregate_over_empty_input() {
        let agg = Packet::aggregate(
            "agg",
            BufferOptions::default(),
            kv_scan("scan", &[]),
            sum_by_key(),
            Arc::new(BytesComparator),
        )
        .unwrap();
        assert!(run(&agg).unwrap().is_empty());
    }

    #[test]
    fn partial_aggregate_merges_workers() {
        let rows: Vec<_> = (0..600).map(|i| (i % 5, i)).collect();
        let agg = Packet::partial_aggregate(
            "agg",
            BufferOptions::default(),
            kv_scan("scan", &rows),
            sum_by_key(),
        )
        .unwrap();
        agg.set_parallelism(3);

        let expected: Vec<_> = (0..5)
            .map(|k| {
                let vals: Vec<i64> = rows
                    .iter()
                    .filter(|(key, _)| *key == k)
                    .map(|(_, v)| *v as i64)
                    .collect();
                (k, vals.len() as i64, vals.iter().sum())
            })
            .collect();
        assert_eq!(expected, groups(&run(&agg).unwrap()));
    }

    #[test]
    fn partial_global_count() {
        let rows: Vec<_> = (0..50).map(|i| (i, i)).collect();
        let agg = Packet::partial_aggregate(
            "count",
            BufferOptions::default(),
            kv_scan("scan", &rows),
            Box::new(SimpleAggregate::count(8).unwrap()),
        )
        .unwrap();
        agg.set_parallelism(4);

        let out = run(&agg).unwrap();
        assert_eq!(1, out.len());
        assert_eq!(50, out[0].read_i64(0).unwrap());
    }

    #[test]
    fn rejects_input_size_mismatch() {
        let res = Packet::aggregate(
            "agg",
            BufferOptions::default(),
            kv_scan("scan", &[]),
            Box::new(SimpleAggregate::count(12).unwrap()),
            Arc::new(BytesComparator),
        );
        assert!(res.is_err());
    }
}

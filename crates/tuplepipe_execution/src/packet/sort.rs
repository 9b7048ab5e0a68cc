use std::sync::Arc;

use rayon::slice::ParallelSliceMut;
use tracing::debug;
use tuplepipe_error::{plan_err, Result};

use super::filter_project::emit_filtered;
use super::{check_input_size, Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::key::{compare_keys, KeyComparator, KeyExtractor};
use crate::operators::Filter;
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::tuple::Tuple;

#[derive(Debug)]
pub struct SortStage {
    extractor: KeyExtractor,
    comparator: Arc<dyn KeyComparator>,
    emit_filter: Option<Box<dyn Filter>>,
}

impl Packet {
    /// Materialize `input`, order it by the extracted keys and stream it out.
    ///
    /// Ties keep their arrival order. An `emit_filter` runs over the ordered
    /// tuples, emission stops as soon as it reports being exhausted.
    pub fn sort(
        name: impl Into<String>,
        opts: BufferOptions,
        input: PacketRef,
        extractor: KeyExtractor,
        comparator: Arc<dyn KeyComparator>,
        emit_filter: Option<Box<dyn Filter>>,
    ) -> Result<PacketRef> {
        let name = name.into();
        let input_size = input.output_size();
        extractor
            .validate(input_size)
            .map_err(|e| plan_err!("'{name}' sort key: {e}"))?;

        let output_size = match &emit_filter {
            Some(filter) => {
                check_input_size(&name, &input, filter.input_size())?;
                filter.output_size()
            }
            None => input_size,
        };

        Packet::build(
            name,
            output_size,
            opts,
            vec![input],
            PacketKind::Sort(SortStage {
                extractor,
                comparator,
                emit_filter,
            }),
        )
    }
}

impl SortStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let stage = packet.stage_info(StageKind::Sort, false, qs);
        let input = packet.input(0).output().clone();
        let output = packet.output().clone();
        let threshold = qs.config().parallel_sort_threshold;

        packet.spawn_producers(qs, &stage, |_, _| {
            let input = input.clone();
            let output = output.clone();
            let extractor = self.extractor.clone();
            let comparator = self.comparator.clone();
            let emit_filter = self.emit_filter.clone();
            move || {
                let sorted = sort_input(&input, &extractor, comparator.as_ref(), threshold)?;
                emit_sorted(sorted, &output, emit_filter)
            }
        })
    }
}

fn sort_input(
    input: &TupleBuffer,
    extractor: &KeyExtractor,
    comparator: &dyn KeyComparator,
    parallel_threshold: usize,
) -> Result<Vec<Tuple>> {
    let mut rows: Vec<(Vec<u8>, Tuple)> = Vec::new();
    while let Some(tuple) = input.get()? {
        let key = extractor.extract(&tuple)?.into_owned();
        rows.push((key, tuple));
    }

    let parallel = rows.len() > parallel_threshold;
    if parallel {
        rows.par_sort_by(|a, b| compare_keys(comparator, &a.0, &b.0));
    } else {
        rows.sort_by(|a, b| compare_keys(comparator, &a.0, &b.0));
    }
    debug!(buffer = input.name(), rows = rows.len(), parallel, "sorted input");

    Ok(rows.into_iter().map(|(_, tuple)| tuple).collect())
}

fn emit_sorted(
    sorted: Vec<Tuple>,
    output: &TupleBuffer,
    mut emit_filter: Option<Box<dyn Filter>>,
) -> Result<()> {
    for tuple in sorted {
        let more = match emit_filter.as_mut() {
            Some(filter) => {
                if filter.exhausted() {
                    break;
                }
                emit_filtered(filter.as_mut(), output, &tuple)?
            }
            None => output.put(tuple)?,
        };
        if !more {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::key::{BytesComparator, Int32Comparator};
    use crate::operators::LimitFilter;
    use crate::packet::testutil::*;
    use crate::packet::{assign_query_state, start_all};

    fn sort_packet(
        rows: &[(i32, i32)],
        comparator: Arc<dyn KeyComparator>,
        limit: Option<usize>,
    ) -> PacketRef {
        let emit_filter = limit.map(|n| Box::new(LimitFilter::new(8, n)) as Box<dyn Filter>);
        Packet::sort(
            "sort",
            BufferOptions::default(),
            kv_scan("scan", rows),
            KeyExtractor::range(0, 4),
            comparator,
            emit_filter,
        )
        .unwrap()
    }

    #[test]
    fn sorts_ascending_and_descending() {
        let rows = [(3, 0), (1, 0), (2, 0)];

        let asc = sort_packet(&rows, Arc::new(Int32Comparator::asc()), None);
        assert_eq!(vec![(1, 0), (2, 0), (3, 0)], pairs(&run(&asc).unwrap()));

        let desc = sort_packet(&rows, Arc::new(Int32Comparator::desc()), None);
        assert_eq!(vec![(3, 0), (2, 0), (1, 0)], pairs(&run(&desc).unwrap()));
    }

    #[test]
    fn top_k() {
        let rows = [(3, 0), (1, 0), (2, 0)];

        let asc = sort_packet(&rows, Arc::new(Int32Comparator::asc()), Some(1));
        assert_eq!(vec![(1, 0)], pairs(&run(&asc).unwrap()));

        let desc = sort_packet(&rows, Arc::new(Int32Comparator::desc()), Some(1));
        assert_eq!(vec![(3, 0)], pairs(&run(&desc).unwrap()));

        let more_than_input = sort_packet(&rows, Arc::new(Int32Comparator::asc()), Some(10));
        assert_eq!(3, run(&more_than_input).unwrap().len());
    }

    #[test]
    fn ties_keep_arrival_order() {
        let rows = [(2, 1), (1, 1), (2, 2), (1, 2), (2, 3)];
        let sort = sort_packet(&rows, Arc::new(Int32Comparator::asc()), None);
        assert_eq!(
            vec![(1, 1), (1, 2), (2, 1), (2, 2), (2, 3)],
            pairs(&run(&sort).unwrap())
        );
    }

    #[test]
    fn negative_keys_order_numerically() {
        let rows = [(5, 0), (-7, 0), (0, 0), (-1, 0)];
        let sort = sort_packet(&rows, Arc::new(Int32Comparator::asc()), None);
        assert_eq!(
            vec![(-7, 0), (-1, 0), (0, 0), (5, 0)],
            pairs(&run(&sort).unwrap())
        );
    }

    #[test]
    fn parallel_sort_above_threshold() {
        let rows: Vec<_> = (0..2_000).map(|i| ((i * 7919) % 2_000, i)).collect();
        let sort = Packet::sort(
            "sort",
            BufferOptions::default(),
            kv_scan("scan", &rows),
            KeyExtractor::range(0, 4),
            Arc::new(BytesComparator),
            None,
        )
        .unwrap();

        let config = ExecutionConfig {
            parallel_sort_threshold: 100,
            ..Default::default()
        };
        let qs = QueryState::with_config(config);
        assign_query_state(&sort, &qs).unwrap();
        start_all(&sort, &qs).unwrap();
        let mut out = Vec::new();
        while let Some(t) = sort.output().get().unwrap() {
            out.push(t);
        }
        qs.destroy();

        assert_eq!(rows.len(), out.len());
        assert!(out
            .windows(2)
            .all(|w| w[0].bytes(0, 4).unwrap() <= w[1].bytes(0, 4).unwrap()));
    }

    #[test]
    fn rejects_key_outside_tuple() {
        let res = Packet::sort(
            "sort",
            BufferOptions::default(),
            kv_scan("scan", &[]),
            KeyExtractor::range(6, 4),
            Arc::new(BytesComparator),
            None,
        );
        assert!(res.is_err());
    }
}

use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tuplepipe_error::{plan_err, Result};

use super::filter_project::emit_filtered;
use super::{check_input_size, Packet, PacketKind, PacketRef};
use crate::buffer::{BufferOptions, TupleBuffer};
use crate::operators::{Filter, Join, JoinKeys};
use crate::query::QueryState;
use crate::scheduler::StageKind;
use crate::tuple::Tuple;
use crate::util::barrier::PublishBarrier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HashJoinOptions {
    /// Emit unmatched left tuples through `Join::left_outer`.
    pub outer: bool,
    /// Drop byte-identical tuples from the build side.
    pub distinct: bool,
}

#[derive(Debug)]
pub struct HashJoinStage {
    join: Box<dyn Join>,
    post_filter: Option<Box<dyn Filter>>,
    options: HashJoinOptions,
}

/// Build side of the join, read-only once published.
#[derive(Debug, Default)]
struct HashTable {
    rows: Vec<Tuple>,
    index: HashMap<Box<[u8]>, Vec<usize>, RandomState>,
}

impl Packet {
    /// Equi-join `left` against `right`.
    ///
    /// `right` is the build side. It's fully materialized before any probe
    /// worker reads `left`. Duplicate keys produce every matching pair. The
    /// optional `post_filter` runs over each joined tuple.
    pub fn hash_join(
        name: impl Into<String>,
        opts: BufferOptions,
        left: PacketRef,
        right: PacketRef,
        join: Box<dyn Join>,
        post_filter: Option<Box<dyn Filter>>,
        options: HashJoinOptions,
    ) -> Result<PacketRef> {
        let name = name.into();
        let keys = *join.keys();
        check_input_size(&name, &left, keys.left_size)?;
        check_input_size(&name, &right, keys.right_size)?;

        let output_size = match &post_filter {
            Some(filter) => {
                if filter.input_size() != keys.output_size {
                    return Err(plan_err!(
                        "'{name}' post filter expects {} byte tuples but the join produces {}",
                        filter.input_size(),
                        keys.output_size
                    ));
                }
                filter.output_size()
            }
            None => keys.output_size,
        };

        Packet::build(
            name,
            output_size,
            opts,
            vec![left, right],
            PacketKind::HashJoin(HashJoinStage {
                join,
                post_filter,
                options,
            }),
        )
    }
}

impl HashJoinStage {
    pub(super) fn start(&self, packet: &Packet, qs: &Arc<QueryState>) -> Result<()> {
        let barrier = PublishBarrier::new();
        let keys = *self.join.keys();
        let distinct = self.options.distinct;

        let build_stage = packet.stage_info(StageKind::HashJoinBuild, false, qs);
        let right = packet.input(1).output().clone();
        let build_barrier = barrier.clone();
        qs.spawn_worker(&build_stage, 0, None, move || {
            let _guard = build_barrier.abort_guard();
            let table = build_table(&right, &keys, distinct)?;
            build_barrier.unblock(Some(Arc::new(table)));
            Ok(())
        })?;

        let probe_stage = packet.stage_info(StageKind::HashJoinProbe, true, qs);
        let left = packet.input(0).output().clone();
        let output = packet.output().clone();
        let outer = self.options.outer;

        packet.spawn_producers(qs, &probe_stage, |_, _| {
            let barrier = barrier.clone();
            let left = left.clone();
            let output = output.clone();
            let mut prober = Prober {
                join: self.join.clone(),
                post_filter: self.post_filter.clone(),
                keys,
                output,
            };
            move || {
                // Build side gave up, the query is already failing.
                let Some(table) = barrier.wait() else {
                    return Ok(());
                };
                prober.run(&left, &table, outer)
            }
        })
    }
}

fn build_table(input: &TupleBuffer, keys: &JoinKeys, distinct: bool) -> Result<HashTable> {
    let mut rows: Vec<Tuple> = Vec::new();
    let mut index: HashMap<Box<[u8]>, Vec<usize>, RandomState> =
        HashMap::with_hasher(RandomState::new());
    let mut duplicates = 0;

    while let Some(tuple) = input.get()? {
        let key = keys.right_key(&tuple)?;
        match index.get_mut(key) {
            Some(bucket) => {
                if distinct && bucket.iter().any(|&idx| rows[idx] == tuple) {
                    duplicates += 1;
                    continue;
                }
                bucket.push(rows.len());
            }
            None => {
                index.insert(key.into(), vec![rows.len()]);
            }
        }
        rows.push(tuple);
    }

    debug!(
        buffer = input.name(),
        rows = rows.len(),
        keys = index.len(),
        duplicates,
        "built hash table"
    );
    Ok(HashTable { rows, index })
}

/// Per worker probe state.
struct Prober {
    join: Box<dyn Join>,
    post_filter: Option<Box<dyn Filter>>,
    keys: JoinKeys,
    output: Arc<TupleBuffer>,
}

impl Prober {
    fn run(&mut self, left: &TupleBuffer, table: &HashTable, outer: bool) -> Result<()> {
        if table.rows.is_empty() && !outer {
            left.detach_consumer();
            return Ok(());
        }

        while let Some(tuple) = left.get()? {
            let key = self.keys.left_key(&tuple)?;
            let more = match table.index.get(key) {
                Some(bucket) => self.emit_matches(&tuple, bucket, &table.rows)?,
                None if outer => {
                    let mut joined = Tuple::zeroed(self.keys.output_size);
                    self.join.left_outer(&mut joined, &tuple)?;
                    self.emit(joined)?
                }
                None => true,
            };
            if !more {
                left.detach_consumer();
                break;
            }
        }
        Ok(())
    }

    fn emit_matches(&mut self, left: &Tuple, bucket: &[usize], rows: &[Tuple]) -> Result<bool> {
        for &idx in bucket {
            let mut joined = Tuple::zeroed(self.keys.output_size);
            self.join.combine(&mut joined, left, &rows[idx])?;
            if !self.emit(joined)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn emit(&mut self, joined: Tuple) -> Result<bool> {
        match self.post_filter.as_mut() {
            Some(filter) => emit_filtered(filter.as_mut(), &self.output, &joined),
            None => self.output.put(joined),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{ConcatJoin, FnFilter};
    use crate::packet::testutil::*;

    /// (left k, left v, right k, right v) quadruples, sorted.
    fn joined(tuples: &[Tuple]) -> Vec<(i32, i32, i32, i32)> {
        let mut out: Vec<_> = tuples
            .iter()
            .map(|t| {
                (
                    t.read_i32(0).unwrap(),
                    t.read_i32(4).unwrap(),
                    t.read_i32(8).unwrap(),
                    t.read_i32(12).unwrap(),
                )
            })
            .collect();
        out.sort();
        out
    }

    fn join_packet(
        left: &[(i32, i32)],
        right: &[(i32, i32)],
        key_len: usize,
        post_filter: Option<Box<dyn Filter>>,
        options: HashJoinOptions,
    ) -> PacketRef {
        Packet::hash_join(
            "join",
            BufferOptions::with_capacity(4),
            kv_scan("left", left),
            kv_scan("right", right),
            Box::new(ConcatJoin::new(8, 0, 8, 0, key_len).unwrap()),
            post_filter,
            options,
        )
        .unwrap()
    }

    #[test]
    fn duplicate_keys_cross_product() {
        let join = join_packet(
            &[(1, 100), (2, 200), (4, 400)],
            &[(1, 10), (2, 20), (2, 21), (3, 30)],
            4,
            None,
            HashJoinOptions::default(),
        );
        assert_eq!(
            vec![(1, 100, 1, 10), (2, 200, 2, 20), (2, 200, 2, 21)],
            joined(&run(&join).unwrap())
        );
    }

    #[test]
    fn empty_build_side() {
        let rows: Vec<_> = (0..100).map(|i| (i, i)).collect();
        let join = join_packet(&rows, &[], 4, None, HashJoinOptions::default());
        assert!(run(&join).unwrap().is_empty());
    }

    #[test]
    fn left_outer() {
        let join = join_packet(
            &[(1, 100), (5, 500)],
            &[(1, 10)],
            4,
            None,
            HashJoinOptions {
                outer: true,
                distinct: false,
            },
        );
        assert_eq!(
            vec![(1, 100, 1, 10), (5, 500, 0, 0)],
            joined(&run(&join).unwrap())
        );
    }

    #[test]
    fn distinct_build_side() {
        let options = HashJoinOptions {
            outer: false,
            distinct: true,
        };
        let join = join_packet(&[(7, 1)], &[(7, 2), (7, 2), (7, 3)], 4, None, options);
        assert_eq!(
            vec![(7, 1, 7, 2), (7, 1, 7, 3)],
            joined(&run(&join).unwrap())
        );
    }

    #[test]
    fn cross_join_with_empty_key() {
        let join = join_packet(
            &[(1, 1), (2, 2)],
            &[(9, 9)],
            0,
            None,
            HashJoinOptions::default(),
        );
        assert_eq!(
            vec![(1, 1, 9, 9), (2, 2, 9, 9)],
            joined(&run(&join).unwrap())
        );
    }

    #[test]
    fn post_filter_on_joined_row() {
        // Keep pairs where the right value exceeds half the left value.
        let filter = FnFilter::new(16, |t| Ok(t.read_i32(12)? * 2 > t.read_i32(4)?));
        let join = join_packet(
            &[(1, 30), (2, 10)],
            &[(1, 10), (2, 10)],
            4,
            Some(Box::new(filter)),
            HashJoinOptions::default(),
        );
        assert_eq!(vec![(2, 10, 2, 10)], joined(&run(&join).unwrap()));
    }

    #[test]
    fn replicated_probe() {
        let left: Vec<_> = (0..400).map(|i| (i % 20, i)).collect();
        let right: Vec<_> = (0..20).map(|i| (i, -i)).collect();
        let join = join_packet(&left, &right, 4, None, HashJoinOptions::default());
        join.set_parallelism(4);

        let out = joined(&run(&join).unwrap());
        assert_eq!(400, out.len());
        assert!(out.iter().all(|(lk, _, rk, rv)| lk == rk && *rv == -rk));
    }

    #[test]
    fn rejects_bad_post_filter() {
        let res = Packet::hash_join(
            "join",
            BufferOptions::default(),
            kv_scan("left", &[]),
            kv_scan("right", &[]),
            Box::new(ConcatJoin::new(8, 0, 8, 0, 4).unwrap()),
            Some(Box::new(FnFilter::new(8, |_| Ok(true)))),
            HashJoinOptions::default(),
        );
        assert!(res.is_err());
    }
}

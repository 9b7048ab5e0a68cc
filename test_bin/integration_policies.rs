mod util;

use std::sync::Arc;
use std::thread;

use tuplepipe_error::Result;
use tuplepipe_execution::key::{Int32Comparator, KeyExtractor};
use tuplepipe_execution::operators::{Aggregate, AggregateExpr, SimpleAggregate};
use tuplepipe_execution::scheduler::{
    CpuSet, Placement, QueryPlacement, RoundRobinCpuPolicy, SchedulingPolicy, StageInfo,
};
use tuplepipe_execution::tuple::schema::{FieldType, TupleSchema, Value};
use tuplepipe_execution::{
    assign_query_state, process_query, BufferOptions, CollectConsumer, ExecutionConfig, Packet,
    PacketRef, PolicyKind, QueryState, Tuple,
};
use util::{
    decode_revenue, execute, execute_with_policy, expected_revenue, full_scan, revenue_plan, table,
};

const POLICIES: [PolicyKind; 4] = [
    PolicyKind::Os,
    PolicyKind::RrCpu,
    PolicyKind::RrModule,
    PolicyKind::QueryCpu,
];

#[test]
fn results_independent_of_policy() {
    for policy in POLICIES {
        for (probe_workers, aggregate_workers) in [(1, 1), (2, 3), (4, 2)] {
            let config = ExecutionConfig {
                policy,
                buffer_capacity: 8,
                ..Default::default()
            };
            let out: Vec<_> = execute(&revenue_plan(probe_workers, aggregate_workers), config)
                .unwrap()
                .iter()
                .map(decode_revenue)
                .collect();
            assert_eq!(expected_revenue(), out, "policy {policy}");
        }
    }
}

#[test]
fn policy_from_json_config() {
    let config = ExecutionConfig::from_json(r#"{"policy": "rr_cpu", "stage_parallelism": 2}"#)
        .unwrap();
    let out: Vec<_> = execute(&revenue_plan(0, 0), config)
        .unwrap()
        .iter()
        .map(decode_revenue)
        .collect();
    assert_eq!(expected_revenue(), out);
}

#[test]
fn concurrent_queries_share_policy() {
    logutil::init_test();
    let policy: Arc<dyn SchedulingPolicy> = Arc::new(RoundRobinCpuPolicy::new(CpuSet::detect()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let policy = policy.clone();
            thread::spawn(move || {
                let root = revenue_plan(2, 2);
                let qs = QueryState::new(policy, ExecutionConfig::default());
                assign_query_state(&root, &qs).unwrap();
                let mut consumer = CollectConsumer::default();
                process_query(&root, &mut consumer).unwrap();
                consumer
                    .tuples
                    .iter()
                    .map(decode_revenue)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(expected_revenue(), handle.join().unwrap());
    }
}

/// Asks for the same number of workers for every stage, replicable or not.
#[derive(Debug)]
struct FixedWorkers(usize);

impl SchedulingPolicy for FixedWorkers {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn create_query_state(&self) -> Box<dyn QueryPlacement> {
        Box::new(FixedWorkers(self.0))
    }
}

impl QueryPlacement for FixedWorkers {
    fn workers_for(&self, _stage: &StageInfo) -> usize {
        self.0
    }

    fn place(&self, _stage: &StageInfo, _worker: usize) -> Placement {
        Placement::Unbound
    }
}

/// Sum aggregate that can't combine partial states.
#[derive(Debug, Clone)]
struct UnmergeableSum(SimpleAggregate);

impl Aggregate for UnmergeableSum {
    fn key_extractor(&self) -> &KeyExtractor {
        self.0.key_extractor()
    }

    fn input_size(&self) -> usize {
        self.0.input_size()
    }

    fn state_size(&self) -> usize {
        self.0.state_size()
    }

    fn output_size(&self) -> usize {
        self.0.output_size()
    }

    fn init(&mut self, state: &mut Tuple) -> Result<()> {
        self.0.init(state)
    }

    fn update(&mut self, state: &mut Tuple, tuple: &Tuple) -> Result<()> {
        self.0.update(state, tuple)
    }

    fn finish(&mut self, dest: &mut Tuple, key: &[u8], state: &Tuple) -> Result<()> {
        self.0.finish(dest, key, state)
    }
}

fn group_scan() -> PacketRef {
    let schema = TupleSchema::builder().int32("g").int32("v").build();
    let rows = (0..200)
        .rev()
        .map(|v| vec![Value::Int32(v % 5), Value::Int32(v)])
        .collect();
    full_scan("groups", table("groups", schema, rows))
}

fn sum_by_group() -> SimpleAggregate {
    SimpleAggregate::new(
        8,
        KeyExtractor::range(0, 4),
        vec![AggregateExpr::Sum {
            offset: 4,
            ty: FieldType::Int32,
        }],
    )
    .unwrap()
}

fn sorted_groups(input: PacketRef) -> PacketRef {
    Packet::sort(
        "by_group",
        BufferOptions::default(),
        input,
        KeyExtractor::range(0, 4),
        Arc::new(Int32Comparator::asc()),
        None,
    )
    .unwrap()
}

fn decode_rows(tuples: &[Tuple]) -> Vec<(i32, i64)> {
    tuples
        .iter()
        .map(|t| (t.read_i32(0).unwrap(), i64::from(t.read_i32(4).unwrap())))
        .collect()
}

fn decode_sums(tuples: &[Tuple]) -> Vec<(i32, i64)> {
    tuples
        .iter()
        .map(|t| (t.read_i32(0).unwrap(), t.read_i64(4).unwrap()))
        .collect()
}

type Decode = fn(&[Tuple]) -> Vec<(i32, i64)>;

/// Plans made of stages that only ever run one worker.
fn single_worker_plans() -> Vec<(&'static str, PacketRef, Decode, Vec<(i32, i64)>)> {
    let scanned: Vec<_> = (0..200i32).rev().map(|v| (v % 5, i64::from(v))).collect();
    let mut sorted = scanned.clone();
    sorted.sort_by_key(|(g, _)| *g);
    let sums: Vec<_> = (0..5i32)
        .map(|g| (g, (0..200i32).filter(|v| v % 5 == g).map(i64::from).sum::<i64>()))
        .collect();

    let aggregate = Packet::aggregate(
        "sum",
        BufferOptions::default(),
        sorted_groups(group_scan()),
        Box::new(sum_by_group()),
        Arc::new(Int32Comparator::asc()),
    )
    .unwrap();
    let partial = sorted_groups(
        Packet::partial_aggregate(
            "sum",
            BufferOptions::default(),
            group_scan(),
            Box::new(UnmergeableSum(sum_by_group())),
        )
        .unwrap(),
    );

    vec![
        ("scan", group_scan(), decode_rows as Decode, scanned),
        ("sort", sorted_groups(group_scan()), decode_rows as Decode, sorted),
        ("aggregate", aggregate, decode_sums as Decode, sums.clone()),
        ("unmergeable partial aggregate", partial, decode_sums as Decode, sums),
    ]
}

#[test]
fn single_worker_stages_ignore_requested_workers() {
    for workers in [0, 1, 3] {
        for (name, plan, decode, expected) in single_worker_plans() {
            let config = ExecutionConfig {
                query_timeout_ms: Some(10_000),
                ..Default::default()
            };
            let policy: Arc<dyn SchedulingPolicy> = Arc::new(FixedWorkers(workers));
            let out = execute_with_policy(&plan, policy, config).unwrap();
            assert_eq!(expected, decode(&out), "{name} with {workers} workers");
        }
    }
}

#[test]
fn custom_worker_counts_keep_results() {
    for workers in [0, 3] {
        let policy: Arc<dyn SchedulingPolicy> = Arc::new(FixedWorkers(workers));
        let config = ExecutionConfig {
            query_timeout_ms: Some(10_000),
            ..Default::default()
        };
        let out: Vec<_> = execute_with_policy(&revenue_plan(0, 0), policy, config)
            .unwrap()
            .iter()
            .map(decode_revenue)
            .collect();
        assert_eq!(expected_revenue(), out, "{workers} workers");
    }
}

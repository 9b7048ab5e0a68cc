//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use tuplepipe_error::Result;
use tuplepipe_execution::key::{Float64Comparator, KeyExtractor};
use tuplepipe_execution::scheduler::SchedulingPolicy;
use tuplepipe_execution::operators::{AggregateExpr, ConcatJoin, SimpleAggregate, TrivialFilter};
use tuplepipe_execution::storage::{MemoryTable, Table, TransactionContext};
use tuplepipe_execution::tuple::schema::{FieldType, TupleSchema, Value};
use tuplepipe_execution::{
    assign_query_state, process_query, BufferOptions, CollectConsumer, ExecutionConfig,
    HashJoinOptions, Packet, PacketRef, QueryState, Tuple,
};

/// Build an in-memory table, one `Value` row per entry.
pub fn table(name: &str, schema: TupleSchema, rows: Vec<Vec<Value>>) -> Arc<dyn Table> {
    let table = MemoryTable::new(name, schema);
    for row in rows {
        table.insert(&row).unwrap();
    }
    Arc::new(table)
}

/// Scan passing every row through unchanged.
pub fn full_scan(name: &str, table: Arc<dyn Table>) -> PacketRef {
    let row_size = table.row_size();
    Packet::scan(
        name,
        BufferOptions::with_capacity(16),
        table,
        TransactionContext::default(),
        Box::new(TrivialFilter::new(row_size)),
    )
    .unwrap()
}

/// Attach `root` to a new query and run it to completion.
pub fn execute(root: &PacketRef, config: ExecutionConfig) -> Result<Vec<Tuple>> {
    let policy = config.build_policy();
    execute_with_policy(root, policy, config)
}

/// Like `execute`, placing workers with `policy` instead of the configured
/// one.
pub fn execute_with_policy(
    root: &PacketRef,
    policy: Arc<dyn SchedulingPolicy>,
    config: ExecutionConfig,
) -> Result<Vec<Tuple>> {
    logutil::init_test();
    let qs = QueryState::new(policy, config);
    assign_query_state(root, &qs)?;

    let mut consumer = CollectConsumer::default();
    let res = process_query(root, &mut consumer);
    assert_eq!(0, qs.active_workers(), "workers left running");
    res.map(|_| consumer.tuples)
}

pub fn execute_default(root: &PacketRef) -> Result<Vec<Tuple>> {
    execute(root, ExecutionConfig::default())
}

/// Revenue per region over orders joined to customers, highest first.
pub fn revenue_plan(probe_workers: usize, aggregate_workers: usize) -> PacketRef {
    let customers = TupleSchema::builder()
        .int32("c_id")
        .fixed_bytes("c_region", 8)
        .build();
    let orders = TupleSchema::builder()
        .int32("o_cust")
        .float64("o_price")
        .build();

    let regions = ["ASIA", "EUROPE", "AFRICA"];
    let customer_rows = (0..30)
        .map(|id| vec![Value::Int32(id), Value::bytes(regions[id as usize % 3])])
        .collect();
    let order_rows = (0..300)
        .map(|i| vec![Value::Int32(i % 30), Value::Float64(i as f64)])
        .collect();

    // (o_cust, o_price) ++ (c_id, c_region) = 12 + 12 bytes.
    let join = Packet::hash_join(
        "orders_customers",
        BufferOptions::default(),
        full_scan("orders", table("orders", orders, order_rows)),
        full_scan("customers", table("customers", customers, customer_rows)),
        Box::new(ConcatJoin::new(12, 0, 12, 0, 4).unwrap()),
        None,
        HashJoinOptions::default(),
    )
    .unwrap();
    join.set_parallelism(probe_workers);

    let aggregate = SimpleAggregate::new(
        24,
        KeyExtractor::range(16, 8),
        vec![AggregateExpr::Sum {
            offset: 4,
            ty: FieldType::Float64,
        }],
    )
    .unwrap();
    let grouped = Packet::partial_aggregate(
        "by_region",
        BufferOptions::default(),
        join,
        Box::new(aggregate),
    )
    .unwrap();
    grouped.set_parallelism(aggregate_workers);

    // (region, revenue), sorted by revenue descending.
    Packet::sort(
        "top_regions",
        BufferOptions::default(),
        grouped,
        KeyExtractor::range(8, 8),
        Arc::new(Float64Comparator::desc()),
        None,
    )
    .unwrap()
}

pub fn expected_revenue() -> Vec<(String, f64)> {
    let regions = ["ASIA", "EUROPE", "AFRICA"];
    let mut totals = [0.0; 3];
    for i in 0..300 {
        totals[(i % 30) % 3] += i as f64;
    }
    let mut out: Vec<_> = regions
        .iter()
        .zip(totals)
        .map(|(r, t)| (r.to_string(), t))
        .collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    out
}

/// Decode a `(region, revenue)` output tuple.
pub fn decode_revenue(tuple: &Tuple) -> (String, f64) {
    let region = Value::bytes(tuple.bytes(0, 8).unwrap());
    (
        region.as_str().unwrap().to_string(),
        tuple.read_f64(8).unwrap(),
    )
}

mod util;

use std::sync::Arc;

use tuplepipe_execution::key::{BytesComparator, Int32Comparator, KeyComparator, KeyExtractor};
use tuplepipe_execution::operators::{
    CompareOp, ConcatJoin, Filter, LimitFilter, Predicate, PredicateFilter, Projection, Scalar,
    SimpleAggregate,
};
use tuplepipe_execution::storage::{Table, TransactionContext};
use tuplepipe_execution::tuple::schema::{TupleSchema, Value};
use tuplepipe_execution::{BufferOptions, HashJoinOptions, Packet};
use util::{execute_default, expected_revenue, full_scan, revenue_plan, table};

fn values_table(name: &str, values: &[i32]) -> Arc<dyn Table> {
    let schema = TupleSchema::builder().int32("value").build();
    table(
        name,
        schema,
        values.iter().map(|v| vec![Value::Int32(*v)]).collect(),
    )
}

#[test]
fn filtered_count() {
    let filter = PredicateFilter::new(
        4,
        Predicate::scalar(0, CompareOp::Gt, Scalar::Int32(2)),
        Projection::Identity,
    )
    .unwrap();
    let scan = Packet::scan(
        "values",
        BufferOptions::default(),
        values_table("values", &[1, 2, 3, 4, 5]),
        TransactionContext::default(),
        Box::new(filter),
    )
    .unwrap();
    let count = Packet::aggregate(
        "count",
        BufferOptions::default(),
        scan,
        Box::new(SimpleAggregate::count(4).unwrap()),
        Arc::new(BytesComparator),
    )
    .unwrap();

    let out = execute_default(&count).unwrap();
    assert_eq!(1, out.len());
    assert_eq!(3, out[0].read_i64(0).unwrap());
}

#[test]
fn filter_packet_then_count() {
    let filter = PredicateFilter::new(
        4,
        Predicate::scalar(0, CompareOp::Gt, Scalar::Int32(2)),
        Projection::Identity,
    )
    .unwrap();
    let filtered = Packet::filter_project(
        "filter",
        BufferOptions::default(),
        full_scan("values", values_table("values", &[1, 2, 3, 4, 5])),
        Box::new(filter),
    )
    .unwrap();
    let count = Packet::partial_aggregate(
        "count",
        BufferOptions::default(),
        filtered,
        Box::new(SimpleAggregate::count(4).unwrap()),
    )
    .unwrap();

    let out = execute_default(&count).unwrap();
    assert_eq!(1, out.len());
    assert_eq!(3, out[0].read_i64(0).unwrap());
}

#[test]
fn join_with_duplicate_keys() {
    let left_schema = TupleSchema::builder()
        .int32("lk")
        .fixed_bytes("lname", 4)
        .build();
    let right_schema = TupleSchema::builder()
        .int32("rk")
        .fixed_bytes("rname", 4)
        .build();
    let joined_schema = left_schema.concat(&right_schema);

    let left = table(
        "left",
        left_schema.clone(),
        vec![
            vec![Value::Int32(1), Value::bytes("a")],
            vec![Value::Int32(2), Value::bytes("b")],
        ],
    );
    let right = table(
        "right",
        right_schema.clone(),
        vec![
            vec![Value::Int32(1), Value::bytes("x")],
            vec![Value::Int32(2), Value::bytes("y")],
            vec![Value::Int32(2), Value::bytes("z")],
        ],
    );

    let join = Packet::hash_join(
        "join",
        BufferOptions::default(),
        full_scan("left", left),
        full_scan("right", right),
        Box::new(ConcatJoin::new(8, 0, 8, 0, 4).unwrap()),
        None,
        HashJoinOptions::default(),
    )
    .unwrap();

    let mut rows: Vec<_> = execute_default(&join)
        .unwrap()
        .iter()
        .map(|t| {
            let values = joined_schema.decode(t).unwrap();
            (
                values[0].as_i64().unwrap(),
                values[1].as_str().unwrap().to_string(),
                values[3].as_str().unwrap().to_string(),
            )
        })
        .collect();
    rows.sort();

    let expected = vec![
        (1, "a".to_string(), "x".to_string()),
        (2, "b".to_string(), "y".to_string()),
        (2, "b".to_string(), "z".to_string()),
    ];
    assert_eq!(expected, rows);
}

fn sort_values(
    values: &[i32],
    comparator: Arc<dyn KeyComparator>,
    limit: Option<usize>,
) -> Vec<i32> {
    let emit_filter = limit.map(|n| Box::new(LimitFilter::new(4, n)) as Box<dyn Filter>);
    let sort = Packet::sort(
        "sort",
        BufferOptions::default(),
        full_scan("values", values_table("values", values)),
        KeyExtractor::range(0, 4),
        comparator,
        emit_filter,
    )
    .unwrap();

    execute_default(&sort)
        .unwrap()
        .iter()
        .map(|t| t.read_i32(0).unwrap())
        .collect()
}

#[test]
fn sort_and_top_k() {
    let asc: Arc<dyn KeyComparator> = Arc::new(Int32Comparator::asc());
    let desc: Arc<dyn KeyComparator> = Arc::new(Int32Comparator::desc());

    assert_eq!(vec![1, 2, 3], sort_values(&[3, 1, 2], asc.clone(), None));
    assert_eq!(vec![1], sort_values(&[3, 1, 2], asc, Some(1)));
    assert_eq!(vec![3, 2, 1], sort_values(&[3, 1, 2], desc.clone(), None));
    assert_eq!(vec![3], sort_values(&[3, 1, 2], desc, Some(1)));
}

#[test]
fn join_aggregate_sort_pipeline() {
    let out: Vec<_> = execute_default(&revenue_plan(3, 2))
        .unwrap()
        .iter()
        .map(util::decode_revenue)
        .collect();
    assert_eq!(expected_revenue(), out);
}

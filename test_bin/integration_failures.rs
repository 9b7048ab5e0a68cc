mod util;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tuplepipe_error::{operator_err, PipeError};
use tuplepipe_execution::key::{Int32Comparator, KeyExtractor};
use tuplepipe_execution::operators::{ConcatJoin, FnFilter, FnSieve};
use tuplepipe_execution::storage::{MemoryTable, TransactionContext};
use tuplepipe_execution::tuple::schema::{TupleSchema, Value};
use tuplepipe_execution::{
    assign_query_state, process_query, BufferOptions, CollectConsumer, ExecutionConfig,
    HashJoinOptions, Packet, PacketRef, QueryState, Tuple,
};
use util::{execute, execute_default, full_scan, table};

fn numbers(name: &str, count: i32) -> PacketRef {
    let schema = TupleSchema::builder().int32("n").int32("m").build();
    let rows = (0..count)
        .map(|n| vec![Value::Int32(n), Value::Int32(n % 7)])
        .collect();
    full_scan(name, table(name, schema, rows))
}

#[test]
fn failing_filter_aborts_whole_plan() {
    let failing = FnFilter::new(8, |t| {
        if t.read_i32(0)? == 5_000 {
            Err(operator_err!("bad row {}", t.read_i32(0)?))
        } else {
            Ok(true)
        }
    });
    let filter = Packet::filter_project(
        "failing",
        BufferOptions::with_capacity(8),
        numbers("numbers", 20_000),
        Box::new(failing),
    )
    .unwrap();
    filter.set_parallelism(2);

    // Sort blocks until all input arrived, the failure has to unblock it.
    let sort = Packet::sort(
        "sort",
        BufferOptions::default(),
        filter,
        KeyExtractor::range(0, 4),
        Arc::new(Int32Comparator::asc()),
        None,
    )
    .unwrap();

    let start = Instant::now();
    let err = execute_default(&sort).unwrap_err();
    assert!(matches!(err, PipeError::Operator(_)), "{err}");
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn failure_on_join_build_side() {
    let failing = FnFilter::new(8, |t| {
        if t.read_i32(0)? == 50 {
            Err(operator_err!("build side failed"))
        } else {
            Ok(true)
        }
    });
    let right = Packet::filter_project(
        "right_filter",
        BufferOptions::with_capacity(4),
        numbers("right", 100),
        Box::new(failing),
    )
    .unwrap();
    let join = Packet::hash_join(
        "join",
        BufferOptions::with_capacity(4),
        numbers("left", 10_000),
        right,
        Box::new(ConcatJoin::new(8, 0, 8, 0, 4).unwrap()),
        None,
        HashJoinOptions::default(),
    )
    .unwrap();

    let err = execute_default(&join).unwrap_err();
    assert!(matches!(err, PipeError::Operator(_)), "{err}");
}

#[test]
fn panicking_sieve_is_reported() {
    let sieve = FnSieve::new(8, 8, |dest, src| {
        if src.read_i32(0)? == 10 {
            panic!("sieve blew up");
        }
        dest.assign(src)?;
        Ok(true)
    });
    let packet = Packet::sieve(
        "sieve",
        BufferOptions::default(),
        numbers("numbers", 100),
        Box::new(sieve),
    )
    .unwrap();

    match execute_default(&packet) {
        Err(PipeError::WorkerPanicked { message, .. }) => assert_eq!("sieve blew up", message),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn corrupt_row_is_a_scan_error() {
    let schema = TupleSchema::builder().int32("n").int32("m").build();
    let table = MemoryTable::new("corrupt", schema);
    table.insert(&[Value::Int32(1), Value::Int32(1)]).unwrap();
    table.insert_raw(Tuple::zeroed(5));

    let scan = full_scan("corrupt", Arc::new(table));
    let err = execute_default(&scan).unwrap_err();
    assert!(matches!(err, PipeError::Scan(_)), "{err}");
}

#[test]
fn query_timeout() {
    let slow = FnFilter::new(8, |_| {
        thread::sleep(Duration::from_millis(5));
        Ok(true)
    });
    let filter = Packet::filter_project(
        "slow",
        BufferOptions::default(),
        numbers("numbers", 1_000),
        Box::new(slow),
    )
    .unwrap();
    filter.set_parallelism(1);

    let config = ExecutionConfig {
        query_timeout_ms: Some(50),
        ..Default::default()
    };
    let err = execute(&filter, config).unwrap_err();
    assert!(matches!(err, PipeError::Timeout(_)), "{err}");
}

#[test]
fn cancel_from_another_thread() {
    let slow = FnFilter::new(8, |_| {
        thread::sleep(Duration::from_millis(2));
        Ok(true)
    });
    let filter = Packet::filter_project(
        "slow",
        BufferOptions::default(),
        numbers("numbers", 10_000),
        Box::new(slow),
    )
    .unwrap();

    logutil::init_test();
    let qs = QueryState::with_config(ExecutionConfig::default());
    assign_query_state(&filter, &qs).unwrap();

    let canceler = {
        let qs = qs.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            qs.cancel();
        })
    };

    let mut consumer = CollectConsumer::default();
    let err = process_query(&filter, &mut consumer).unwrap_err();
    canceler.join().unwrap();

    assert!(matches!(err, PipeError::Canceled), "{err}");
    assert_eq!(0, qs.active_workers());
}

#[test]
fn plans_are_not_reusable() {
    let scan = numbers("numbers", 10);
    assert_eq!(10, execute_default(&scan).unwrap().len());
    assert!(matches!(
        execute_default(&scan),
        Err(PipeError::PlanConstruction(_))
    ));
}

#[test]
fn mismatched_packets_rejected_at_construction() {
    let res = Packet::sort(
        "sort",
        BufferOptions::default(),
        numbers("numbers", 1),
        KeyExtractor::range(4, 8),
        Arc::new(Int32Comparator::asc()),
        None,
    );
    assert!(matches!(res, Err(PipeError::PlanConstruction(_))));

    let res = Packet::scan(
        "scan",
        BufferOptions::default(),
        table("t", TupleSchema::builder().int32("n").build(), Vec::new()),
        TransactionContext::default(),
        Box::new(FnFilter::new(8, |_| Ok(true))),
    );
    assert!(matches!(res, Err(PipeError::PlanConstruction(_))));
}

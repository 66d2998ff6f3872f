//! End-to-end exercise of the query heap: reserve a share, fill and spill
//! the internal array in two runs, then merge-read both back.

use relcore::config::Config;
use relcore::heap::QueryHeap;
use relcore::page::Tuple;
use relcore::types::ColumnType;
use relcore::value::Value;

fn config() -> Config {
    let mut config = Config::default();
    config.query_heap_size = 2 * 1024 * 1024;
    config.tempspace_directory = tempfile::tempdir().unwrap().into_path();
    config
}

#[test]
fn reserve_fill_spill_twice_and_merge_back_the_full_multiset() {
    let heap = QueryHeap::new(&config());
    let id = heap
        .reserve_sort_heap(vec![ColumnType::Int, ColumnType::Varchar(16)], 200)
        .unwrap();

    let max_tuples = heap.max_internal_tuples(id).unwrap();
    assert!(max_tuples > 0);

    let mut array = heap.get_sort_array(id).unwrap();
    for i in 0..20i32 {
        array.push(vec![Value::Int(i), Value::Varchar(format!("a{}", i))]);
    }
    array.sort_by_key(|t| match &t[0] {
        Value::Int(n) => *n,
        _ => unreachable!(),
    });
    heap.write_run(id, &array, array.len()).unwrap();
    array.clear();

    for i in 20..35i32 {
        array.push(vec![Value::Int(i), Value::Varchar(format!("b{}", i))]);
    }
    heap.write_run(id, &array, array.len()).unwrap();
    heap.release_sort_array(id, array).unwrap();

    let runs = heap.external_runs(id).unwrap();
    assert_eq!(runs.len(), 2);

    let mut merged: Vec<Tuple> = Vec::new();
    for run in runs {
        for tuple in run {
            merged.push(tuple.unwrap());
        }
    }
    assert_eq!(merged.len(), 35);

    let mut ids: Vec<i32> = merged
        .iter()
        .map(|t| match &t[0] {
            Value::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..35).collect::<Vec<_>>());

    heap.release(id).unwrap();
}

/// A 100-byte fixed column with a tiny estimated cardinality: the share
/// formula's `2 * estimated_cardinality * tuple_bytes` term comes out far
/// below the 1600-byte minimum, so the granted share is always exactly the
/// minimum, no exponential sampling spread. With `query_heap_size =
/// 10000` the assignable pool is 5000 bytes, so three reservations at
/// 1600 bytes each reliably leave less than a fourth's minimum free.
fn exhausting_row() -> Vec<ColumnType> {
    vec![ColumnType::Char(100)]
}

#[test]
fn a_waiting_reservation_is_granted_once_one_holder_releases() {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    let _ = env_logger::try_init();

    let mut cfg = config();
    cfg.query_heap_size = 10000;
    let heap = Arc::new(QueryHeap::new(&cfg));

    let first = heap.reserve_sort_heap(exhausting_row(), 1).unwrap();
    let second = heap.reserve_sort_heap(exhausting_row(), 1).unwrap();
    let third = heap.reserve_sort_heap(exhausting_row(), 1).unwrap();

    let heap2 = heap.clone();
    let waiter = thread::spawn(move || heap2.reserve_sort_heap(exhausting_row(), 1));

    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());

    heap.release(first).unwrap();
    let fourth = waiter.join().unwrap().unwrap();

    heap.release(second).unwrap();
    heap.release(third).unwrap();
    heap.release(fourth).unwrap();
}

/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Bounded memory for external merge sort. Operators reserve a byte share
//! up front, sort as much as fits in an internal array, spill the rest to
//! disk as runs, and merge the runs back through lazy iterators.

pub mod spill;

use crate::config::Config;
use crate::page::{PageError, Tuple};
use crate::resource::ResourceError;
use crate::schema::SchemaError;
use crate::types::ColumnType;
use log::warn;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use thiserror::Error;

/// Fraction of the configured heap reserved for spill block buffers,
/// outside the pool operators draw byte shares from.
const SPILL_RESERVE_FRACTION: f64 = 0.5;

/// Cap on a single reservation's share, as a fraction of the assignable
/// pool, so one sort can't starve every other concurrent query.
const PER_ASSIGNMENT_FRACTION: f64 = 0.33;

/// Spill runs are paged at a fixed size independent of table page size.
const SPILL_BLOCK_SIZE: u32 = 8192;

/// Smallest internal array a sort is allowed to run with.
const MIN_INTERNAL_SORT_TUPLES: u64 = 16;

pub type HeapId = i64;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("no heap is reserved under id {0}")]
    UnknownHeap(HeapId),
    #[error("the query heap is closed")]
    Closed,
    #[error("sort needs {0} bytes but at most {1} bytes are ever assignable")]
    InsufficientConfiguredTotal(u64, u64),
    #[error("sort array for heap {0} is already checked out")]
    ArrayAlreadyCheckedOut(HeapId),
    #[error("sort array for heap {0} was not checked out")]
    ArrayNotCheckedOut(HeapId),
    #[error("heap {0} has no runs written")]
    NoRunsWritten(HeapId),
    #[error("heap too small for this sort: {runs} runs exceeds the {max} the assignment can merge")]
    TooManyRuns { runs: usize, max: usize },
    #[error("spill I/O worker thread panicked")]
    SpillWorkerPanicked,
    #[error("spill file released while a reader still held it open")]
    SpillFileStillShared,
    #[error(transparent)]
    OutOfSpace(#[from] OutOfHeapSpaceError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("cannot satisfy the minimum sort array of {minimum} bytes; at most {cap} bytes are ever handed to one assignment")]
pub struct OutOfHeapSpaceError {
    pub minimum: u64,
    pub cap: u64,
}

struct Assignment {
    column_types: Vec<ColumnType>,
    tuple_bytes: usize,
    share_bytes: u64,
    max_tuples: usize,
    array: Option<Vec<Tuple>>,
    spill: Option<Arc<spill::SpillFile>>,
    runs: Vec<spill::RunDescriptor>,
    spill_path: PathBuf,
}

struct HeapState {
    free_assignable: u64,
    next_ticket: u64,
    now_serving: u64,
    assignments: HashMap<HeapId, Assignment>,
}

/// A pool of sort memory shared across concurrently running queries.
///
/// Reservations are served strictly in arrival order: a waiter only
/// proceeds once every reservation ahead of it has either been granted or
/// abandoned, even if a later, smaller request could be satisfied sooner.
pub struct QueryHeap {
    tempspace_dir: PathBuf,
    assignable_total: u64,
    per_assignment_cap: u64,
    state: Mutex<HeapState>,
    free_cv: Condvar,
    closed: AtomicBool,
}

impl QueryHeap {
    pub fn new(config: &Config) -> Self {
        let total = config.query_heap_size;
        let reserved = (total as f64 * SPILL_RESERVE_FRACTION) as u64;
        let assignable_total = total.saturating_sub(reserved);
        let per_assignment_cap = (assignable_total as f64 * PER_ASSIGNMENT_FRACTION) as u64;
        Self {
            tempspace_dir: config.tempspace_directory.clone(),
            assignable_total,
            per_assignment_cap,
            state: Mutex::new(HeapState {
                free_assignable: assignable_total,
                next_ticket: 0,
                now_serving: 0,
                assignments: HashMap::new(),
            }),
            free_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Block until enough bytes are free for at least `MIN_INTERNAL_SORT_TUPLES`
    /// tuples of `column_types`, then hand back a heap id sized somewhere
    /// between that minimum and twice the estimated sorted output.
    pub fn reserve_sort_heap(
        &self,
        column_types: Vec<ColumnType>,
        estimated_cardinality: u64,
    ) -> Result<HeapId, HeapError> {
        let tuple_bytes = estimate_tuple_bytes(&column_types).max(1);
        let minimum = MIN_INTERNAL_SORT_TUPLES * tuple_bytes as u64;

        if minimum > self.per_assignment_cap {
            return Err(OutOfHeapSpaceError {
                minimum,
                cap: self.per_assignment_cap,
            }
            .into());
        }
        if minimum > self.assignable_total {
            return Err(HeapError::InsufficientConfiguredTotal(
                minimum,
                self.assignable_total,
            ));
        }

        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(HeapError::Closed);
            }
            if state.now_serving == ticket && state.free_assignable >= minimum {
                break;
            }
            state = self.free_cv.wait(state).unwrap();
        }

        let free_bytes = state.free_assignable;
        let sampled = exp_sample(free_bytes as f64);
        let cardinality_bound = 2.0 * estimated_cardinality as f64 * tuple_bytes as f64;
        let mut share = (minimum as f64).max(sampled.min(cardinality_bound)) as u64;
        share = share.min(self.per_assignment_cap).min(state.free_assignable);
        share = share.max(minimum);

        state.free_assignable -= share;
        state.now_serving += 1;

        let heap_id = fresh_heap_id(&state.assignments);
        let max_tuples = (share / tuple_bytes as u64) as usize;
        state.assignments.insert(
            heap_id,
            Assignment {
                column_types,
                tuple_bytes,
                share_bytes: share,
                max_tuples,
                array: Some(Vec::with_capacity(max_tuples)),
                spill: None,
                runs: Vec::new(),
                spill_path: self.tempspace_dir.join(format!("qheap.{}", heap_id)),
            },
        );
        drop(state);
        self.free_cv.notify_all();
        Ok(heap_id)
    }

    pub fn max_internal_tuples(&self, id: HeapId) -> Result<usize, HeapError> {
        let state = self.state.lock().unwrap();
        let assignment = state.assignments.get(&id).ok_or(HeapError::UnknownHeap(id))?;
        Ok(assignment.max_tuples)
    }

    pub fn get_sort_array(&self, id: HeapId) -> Result<Vec<Tuple>, HeapError> {
        let mut state = self.state.lock().unwrap();
        let assignment = state.assignments.get_mut(&id).ok_or(HeapError::UnknownHeap(id))?;
        assignment
            .array
            .take()
            .ok_or(HeapError::ArrayAlreadyCheckedOut(id))
    }

    pub fn release_sort_array(&self, id: HeapId, array: Vec<Tuple>) -> Result<(), HeapError> {
        let mut state = self.state.lock().unwrap();
        let assignment = state.assignments.get_mut(&id).ok_or(HeapError::UnknownHeap(id))?;
        if assignment.array.is_some() {
            return Err(HeapError::ArrayNotCheckedOut(id));
        }
        assignment.array = Some(array);
        Ok(())
    }

    /// Spill `tuples[..count]` as one new run. Runs out to disk on a
    /// dedicated thread, joined before returning, so other reservations
    /// can proceed while this one's I/O is in flight.
    pub fn write_run(&self, id: HeapId, tuples: &[Tuple], count: usize) -> Result<(), HeapError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HeapError::Closed);
        }
        let spill = {
            let mut state = self.state.lock().unwrap();
            let assignment = state.assignments.get_mut(&id).ok_or(HeapError::UnknownHeap(id))?;
            if assignment.spill.is_none() {
                let file = spill::SpillFile::create(
                    &assignment.spill_path,
                    &assignment.column_types,
                    SPILL_BLOCK_SIZE,
                )?;
                assignment.spill = Some(Arc::new(file));
            }
            assignment.spill.as_ref().unwrap().clone()
        };

        let chunk = tuples[..count].to_vec();
        let descriptor = match thread::spawn(move || spill.append_run(&chunk)).join() {
            Ok(result) => result?,
            Err(_) => return Err(HeapError::SpillWorkerPanicked),
        };

        let mut state = self.state.lock().unwrap();
        if let Some(assignment) = state.assignments.get_mut(&id) {
            assignment.runs.push(descriptor);
        }
        Ok(())
    }

    /// One lazy iterator per run written so far. Fails if the run count
    /// has grown beyond what this assignment's share can merge.
    pub fn external_runs(&self, id: HeapId) -> Result<Vec<spill::RunIterator>, HeapError> {
        let state = self.state.lock().unwrap();
        let assignment = state.assignments.get(&id).ok_or(HeapError::UnknownHeap(id))?;
        let max_runs = ((assignment.share_bytes / SPILL_BLOCK_SIZE as u64).max(1)) as usize;
        if assignment.runs.len() > max_runs {
            return Err(HeapError::TooManyRuns {
                runs: assignment.runs.len(),
                max: max_runs,
            });
        }
        let spill = assignment.spill.as_ref().ok_or(HeapError::NoRunsWritten(id))?;
        Ok(assignment.runs.iter().map(|d| spill.read_run(*d)).collect())
    }

    /// Drop the assignment, close and delete its spill file if one exists,
    /// and wake waiters now that its share is free.
    pub fn release(&self, id: HeapId) -> Result<(), HeapError> {
        let assignment = {
            let mut state = self.state.lock().unwrap();
            state.assignments.remove(&id).ok_or(HeapError::UnknownHeap(id))?
        };

        if let Some(spill) = assignment.spill {
            match Arc::try_unwrap(spill) {
                Ok(spill) => spill.close_and_delete()?,
                Err(_) => warn!("heap {} released while a run iterator still holds its spill file open", id),
            }
        }

        let mut state = self.state.lock().unwrap();
        state.free_assignable += assignment.share_bytes;
        drop(state);
        self.free_cv.notify_all();
        Ok(())
    }

    /// Cancel all waiters; they surface `HeapError::Closed`. Does not
    /// touch assignments already granted, those must still be released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.free_cv.notify_all();
    }
}

fn estimate_tuple_bytes(column_types: &[ColumnType]) -> usize {
    column_types
        .iter()
        .map(|ty| match ty {
            ColumnType::Char(len) | ColumnType::Varchar(len) => *len as usize,
            other => other.bytes_fixed() as usize,
        })
        .sum()
}

fn exp_sample(mean: f64) -> f64 {
    if mean <= 0.0 {
        return 0.0;
    }
    let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    -mean * u.ln()
}

fn fresh_heap_id(existing: &HashMap<HeapId, Assignment>) -> HeapId {
    loop {
        let candidate = rand::random::<i64>().abs();
        if candidate > 0 && !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::Barrier;

    fn config_with_heap_size(bytes: u64) -> Config {
        let mut config = Config::default();
        config.query_heap_size = bytes;
        config.tempspace_directory = tempfile::tempdir().unwrap().into_path();
        config
    }

    #[test]
    fn reserve_then_release_conserves_bytes() {
        let config = config_with_heap_size(1_000_000);
        let heap = QueryHeap::new(&config);
        let assignable = heap.assignable_total;

        let id = heap.reserve_sort_heap(vec![ColumnType::Int], 10).unwrap();
        {
            let state = heap.state.lock().unwrap();
            let share = state.assignments.get(&id).unwrap().share_bytes;
            assert_eq!(state.free_assignable + share, assignable);
        }
        heap.release(id).unwrap();
        let state = heap.state.lock().unwrap();
        assert_eq!(state.free_assignable, assignable);
    }

    #[test]
    fn minimum_above_the_per_assignment_cap_fails_fast() {
        let config = config_with_heap_size(200);
        let heap = QueryHeap::new(&config);
        let wide_row = vec![ColumnType::Char(1024); 4];
        let err = heap.reserve_sort_heap(wide_row, 1).unwrap_err();
        assert!(matches!(err, HeapError::OutOfSpace(_)));
    }

    #[test]
    fn unknown_heap_id_is_rejected_by_every_operation() {
        let config = config_with_heap_size(1_000_000);
        let heap = QueryHeap::new(&config);
        assert!(matches!(
            heap.max_internal_tuples(999).unwrap_err(),
            HeapError::UnknownHeap(999)
        ));
        assert!(matches!(
            heap.release(999).unwrap_err(),
            HeapError::UnknownHeap(999)
        ));
    }

    #[test]
    fn sort_array_checkout_is_exclusive() {
        let config = config_with_heap_size(1_000_000);
        let heap = QueryHeap::new(&config);
        let id = heap.reserve_sort_heap(vec![ColumnType::Int], 10).unwrap();

        let array = heap.get_sort_array(id).unwrap();
        assert!(matches!(
            heap.get_sort_array(id).unwrap_err(),
            HeapError::ArrayAlreadyCheckedOut(_)
        ));
        heap.release_sort_array(id, array).unwrap();
        assert!(heap.get_sort_array(id).is_ok());
    }

    #[test]
    fn write_run_then_external_runs_roundtrips_tuples() {
        let config = config_with_heap_size(1_000_000);
        let heap = QueryHeap::new(&config);
        let id = heap.reserve_sort_heap(vec![ColumnType::Int], 10).unwrap();

        let tuples: Vec<Tuple> = (0..5).map(|i| vec![Value::Int(i)]).collect();
        heap.write_run(id, &tuples, tuples.len()).unwrap();

        let runs = heap.external_runs(id).unwrap();
        assert_eq!(runs.len(), 1);
        let collected: Vec<Tuple> = runs
            .into_iter()
            .next()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(collected, tuples);

        heap.release(id).unwrap();
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let config = config_with_heap_size(1000);
        let heap = Arc::new(QueryHeap::new(&config));
        let first = heap.reserve_sort_heap(vec![ColumnType::Int], 1).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        let heap2 = heap.clone();
        let barrier2 = barrier.clone();
        let order2 = order.clone();
        let waiter = thread::spawn(move || {
            barrier2.wait();
            let id = heap2.reserve_sort_heap(vec![ColumnType::Int], 1).unwrap();
            order2.lock().unwrap().push(id);
            id
        });

        barrier.wait();
        thread::sleep(std::time::Duration::from_millis(50));
        heap.release(first).unwrap();

        let second = waiter.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![second]);
        heap.release(second).unwrap();
    }

    #[test]
    fn close_cancels_outstanding_waiters() {
        let config = config_with_heap_size(200);
        let heap = Arc::new(QueryHeap::new(&config));
        let wide_row = vec![ColumnType::Int; 2];
        let first = heap.reserve_sort_heap(wide_row.clone(), 1).unwrap();

        let heap2 = heap.clone();
        let wide_row2 = wide_row.clone();
        let waiter = thread::spawn(move || heap2.reserve_sort_heap(wide_row2, 1));

        thread::sleep(std::time::Duration::from_millis(50));
        heap.close();
        assert!(matches!(waiter.join().unwrap().unwrap_err(), HeapError::Closed));
        heap.release(first).unwrap();
    }
}

// ABOUTME: Shared work queue, abort flag and rendezvous barrier for one side's workers
// ABOUTME: Every blocking wait here wakes on abort so no worker is left stranded

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::errors::{Result, SyncError};
use crate::schema::Table;

struct QueueState {
    tables: VecDeque<Table>,
    enqueued: bool,
    aborted: bool,
    snapshot: Option<String>,
    barrier_waiting: usize,
    barrier_generation: u64,
}

/// Coordinates the worker threads of one side: the FIFO of tables awaiting
/// work, the reusable N-way barrier, the first-failure abort flag and the
/// leader-published snapshot token.
pub struct SyncQueue {
    pub workers: usize,
    state: Mutex<QueueState>,
    queue_changed: Condvar,
    barrier_changed: Condvar,
}

impl SyncQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            state: Mutex::new(QueueState {
                tables: VecDeque::new(),
                enqueued: false,
                aborted: false,
                snapshot: None,
                barrier_waiting: 0,
                barrier_generation: 0,
            }),
            queue_changed: Condvar::new(),
            barrier_changed: Condvar::new(),
        }
    }

    /// Leader-only: queues the tables that survive the ignore/only filters,
    /// preserving catalog order.
    pub fn enqueue(&self, tables: &[Table], ignore: &HashSet<String>, only: &HashSet<String>) {
        let mut state = self.state.lock().unwrap();
        state.tables.extend(
            crate::schema::compare::filter_tables(tables, ignore, only)
                .into_iter()
                .cloned(),
        );
        state.enqueued = true;
        self.queue_changed.notify_all();
    }

    /// Takes the next table, blocking until one is available, the queue is
    /// drained (`None`) or the run is aborted (`None` immediately).
    pub fn pop(&self) -> Option<Table> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.aborted {
                return None;
            }
            if let Some(table) = state.tables.pop_front() {
                return Some(table);
            }
            if state.enqueued {
                return None;
            }
            state = self.queue_changed.wait(state).unwrap();
        }
    }

    /// N-way rendezvous, reused across phases. The Nth arrival wakes the
    /// rest; an abort releases every waiter whether or not N ever arrive.
    pub fn wait_at_barrier(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(SyncError::Aborted);
        }
        state.barrier_waiting += 1;
        if state.barrier_waiting == self.workers {
            state.barrier_waiting = 0;
            state.barrier_generation += 1;
            self.barrier_changed.notify_all();
            return Ok(());
        }
        let generation = state.barrier_generation;
        while state.barrier_generation == generation && !state.aborted {
            state = self.barrier_changed.wait(state).unwrap();
        }
        if state.aborted {
            Err(SyncError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sets the abort flag and wakes every blocked waiter. Returns true for
    /// the first caller only, so exactly one worker reports the root cause.
    pub fn abort(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let first = !state.aborted;
        state.aborted = true;
        self.queue_changed.notify_all();
        self.barrier_changed.notify_all();
        first
    }

    pub fn aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub fn check_aborted(&self) -> Result<()> {
        if self.aborted() {
            Err(SyncError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Publishes the snapshot token the leader received from its peer.
    pub fn set_snapshot(&self, token: String) {
        self.state.lock().unwrap().snapshot = Some(token);
    }

    pub fn snapshot(&self) -> Option<String> {
        self.state.lock().unwrap().snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests_support::table_named;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pop_preserves_catalog_order_and_drains() {
        let queue = SyncQueue::new(1);
        let tables = vec![table_named("b"), table_named("a"), table_named("c")];
        queue.enqueue(&tables, &HashSet::new(), &HashSet::new());
        assert_eq!(queue.pop().unwrap().name, "b");
        assert_eq!(queue.pop().unwrap().name, "a");
        assert_eq!(queue.pop().unwrap().name, "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn ignore_wins_over_only() {
        let queue = SyncQueue::new(1);
        let tables = vec![table_named("a"), table_named("b")];
        let ignore: HashSet<String> = ["a".to_string()].into();
        let only: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        queue.enqueue(&tables, &ignore, &only);
        assert_eq!(queue.pop().unwrap().name, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn pop_blocks_until_enqueue() {
        let queue = Arc::new(SyncQueue::new(1));
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.enqueue(&[table_named("t")], &HashSet::new(), &HashSet::new());
        assert_eq!(popper.join().unwrap().unwrap().name, "t");
    }

    #[test]
    fn barrier_releases_when_all_workers_arrive() {
        let queue = Arc::new(SyncQueue::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || queue.wait_at_barrier()));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn barrier_is_reusable_across_phases() {
        let queue = Arc::new(SyncQueue::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                queue.wait_at_barrier()?;
                queue.wait_at_barrier()
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn abort_wakes_barrier_and_pop_waiters() {
        let queue = Arc::new(SyncQueue::new(3));
        let barrier_waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_at_barrier())
        };
        let pop_waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));

        assert!(queue.abort());
        assert!(!queue.abort(), "only the first abort call returns true");

        assert!(matches!(
            barrier_waiter.join().unwrap(),
            Err(SyncError::Aborted)
        ));
        assert!(pop_waiter.join().unwrap().is_none());
        assert!(matches!(queue.check_aborted(), Err(SyncError::Aborted)));
    }

    #[test]
    fn snapshot_slot_round_trips() {
        let queue = SyncQueue::new(1);
        assert!(queue.snapshot().is_none());
        queue.set_snapshot("00000003-0000001B-1".into());
        assert_eq!(queue.snapshot().unwrap(), "00000003-0000001B-1");
    }
}

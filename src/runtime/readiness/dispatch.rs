//! FIFO of ready operations between the poll thread and the workers.

use crate::runtime::op::OpId;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct QueueState {
    entries: VecDeque<OpId>,
    running: bool,
}

/// Mutex + condvar queue of op ids.
///
/// Each entry is handed to exactly one worker. Closing the queue wakes every
/// blocked worker; entries still queued at that point are left for the
/// shutdown drain.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                running: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn open(&self) {
        self.lock().running = true;
    }

    /// Stop handing out entries and wake every waiter.
    pub fn close(&self) {
        self.lock().running = false;
        self.ready.notify_all();
    }

    /// Append an entry and wake one worker.
    pub fn push(&self, id: OpId) {
        self.lock().entries.push_back(id);
        self.ready.notify_one();
    }

    /// Block until an entry is available. `None` once the queue is closed.
    pub fn pop(&self) -> Option<OpId> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return None;
            }
            if let Some(id) = state.entries.pop_front() {
                return Some(id);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove every queued entry.
    pub fn take_all(&self) -> Vec<OpId> {
        self.lock().entries.drain(..).collect()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::ObjectPool;
    use std::collections::HashSet;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<OpId> {
        let mut pool = ObjectPool::new(n, true);
        (0..n).map(|_| pool.get(())).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::new();
        queue.open();

        let ids = ids(5);
        for &id in &ids {
            queue.push(id);
        }
        assert_eq!(queue.len(), 5);

        let popped: Vec<_> = (0..5).filter_map(|_| queue.pop()).collect();
        assert_eq!(popped, ids);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_returns_none() {
        let queue = DispatchQueue::new();
        queue.push(ids(1)[0]);
        // Never opened
        assert!(queue.pop().is_none());
        assert_eq!(queue.take_all().len(), 1);
    }

    #[test]
    fn test_close_wakes_all_waiters() {
        let queue = Arc::new(DispatchQueue::new());
        queue.open();

        let (tx, rx) = mpsc::channel();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let tx = tx.clone();
                thread::spawn(move || {
                    tx.send(queue.pop()).unwrap();
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.close();

        for _ in 0..4 {
            let popped = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(popped.is_none());
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_each_entry_delivered_once() {
        let queue = Arc::new(DispatchQueue::new());
        queue.open();

        let (tx, rx) = mpsc::channel();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let tx = tx.clone();
                thread::spawn(move || {
                    while let Some(id) = queue.pop() {
                        tx.send(id).unwrap();
                    }
                })
            })
            .collect();

        let ids = ids(200);
        for &id in &ids {
            queue.push(id);
        }

        let mut seen = HashSet::new();
        for _ in 0..ids.len() {
            let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(seen.insert(id), "duplicate delivery of {id}");
        }

        queue.close();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(seen.len(), ids.len());
    }
}

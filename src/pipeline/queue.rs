//! Bounded blocking FIFO with an end marker and a cancel flag.

use crate::error::{QtSortError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
    cancelled: bool,
}

/// Thread-safe bounded queue.
///
/// `push` blocks while the queue is full and `pop` blocks while it is empty.
/// After `finish`, `pop` drains the remaining items and then returns
/// `Ok(None)`, the end marker. `cancel` drops queued items and wakes every
/// waiter; from then on `push` and `pop` fail with
/// [`QtSortError::Cancelled`].
///
/// ```rust
/// use qtsort::pipeline::BoundedQueue;
///
/// let queue = BoundedQueue::new(4);
/// queue.push(1)?;
/// queue.push(2)?;
/// queue.finish()?;
/// assert_eq!(queue.pop()?, Some(1));
/// assert_eq!(queue.pop()?, Some(2));
/// assert_eq!(queue.pop()?, None);
/// # Ok::<(), qtsort::QtSortError>(())
/// ```
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                finished: false,
                cancelled: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Append `item`, waiting for space.
    pub fn push(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.cancelled {
            self.not_full.wait(&mut state);
        }
        if state.cancelled {
            return Err(QtSortError::Cancelled);
        }
        if state.finished {
            return Err(QtSortError::QueueFinished);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next item, waiting for one to arrive. Returns `Ok(None)` once
    /// the queue is finished and drained.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.finished && !state.cancelled {
            self.not_empty.wait(&mut state);
        }
        if state.cancelled {
            return Err(QtSortError::Cancelled);
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        Ok(item)
    }

    /// Mark the end of the stream. Items already queued are still delivered.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(QtSortError::Cancelled);
        }
        if state.finished {
            return Err(QtSortError::QueueFinished);
        }
        state.finished = true;
        self.not_empty.notify_all();
        Ok(())
    }

    /// Abort the stream: drop queued items and wake all waiters.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.items.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

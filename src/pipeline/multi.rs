//! Fan-in with deterministic ordering, and the split/merge pattern built on
//! it.

use super::callback::{CallFinish, MapCallback, SplitCallback};
use super::queue::BoundedQueue;
use super::threaded::{Shared, ThreadedCallback};
use crate::error::{QtSortError, Result};
use std::marker::PhantomData;
use std::sync::Arc;

/// Fan-in stage with one queue per producer.
///
/// A single consumer thread takes items from the queues in strict rotation
/// (queue `i % n` for the `i`th item), so when producer `k` handles the items
/// a [`SplitCallback`] dealt to target `k`, the inner stage sees them in the
/// original order. Once one queue ends, every other queue must end too.
pub struct MultiThreadedCallback<T, R> {
    _types: PhantomData<fn(T) -> R>,
}

impl<T, R> MultiThreadedCallback<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Start the consumer and return one handle per producer. Handle `k`
    /// feeds queue `k`.
    pub fn new<C>(name: &str, inner: C, producers: usize, capacity: usize) -> Result<Vec<ThreadedCallback<T, R>>>
    where
        C: CallFinish<CallType = T, ReturnType = R>,
    {
        if producers == 0 {
            return Err(QtSortError::InvalidInput(format!(
                "{}: a stage needs at least one producer",
                name
            )));
        }
        let queues = (0..producers).map(|_| BoundedQueue::new(capacity)).collect();
        let shared = Shared::new(name, queues, producers);
        shared.spawn(move |shared| run_rotation(shared, inner))?;
        Ok((0..producers)
            .map(|slot| ThreadedCallback::from_shared(shared.clone(), slot))
            .collect())
    }
}

fn run_rotation<C>(
    shared: Arc<Shared<C::CallType, C::ReturnType>>,
    mut inner: C,
) -> Result<C::ReturnType>
where
    C: CallFinish,
{
    let n = shared.queues.len();
    let mut ii = 0;
    while let Some(item) = shared.queues[ii % n]
        .pop()
        .map_err(|e| shared.queue_error(e))?
    {
        inner.call(item).map_err(|e| shared.fail(e))?;
        ii += 1;
    }

    let ended = ii % n;
    for k in 1..n {
        let slot = (ended + k) % n;
        if shared.queues[slot]
            .pop()
            .map_err(|e| shared.queue_error(e))?
            .is_some()
        {
            return Err(shared.fail(QtSortError::Pipeline(format!(
                "{}: queue {} still has items after queue {} ended",
                shared.name, slot, ended
            ))));
        }
    }
    log::debug!("{}: merged {} items from {} queues", shared.name, ii, n);
    inner.finish().map_err(|e| shared.fail(e))
}

/// Split items across `n` worker threads applying a mapping function, then
/// merge the mapped items back in their original order into `downstream`.
///
/// ```rust
/// use qtsort::pipeline::{CallFinish, Collect, FanOut};
///
/// let mut stage = FanOut::new("square", |_| |x: u64| Ok(x * x), 3, 2, Collect::new())?;
/// for i in 0..10 {
///     stage.call(i)?;
/// }
/// let squares = stage.finish()?;
/// assert_eq!(squares, (0..10).map(|i| i * i).collect::<Vec<u64>>());
/// # Ok::<(), qtsort::QtSortError>(())
/// ```
pub struct FanOut<In, C: CallFinish> {
    split: SplitCallback<ThreadedCallback<In, Option<C::ReturnType>>>,
}

impl<In, C> FanOut<In, C>
where
    In: Send + 'static,
    C: CallFinish,
{
    /// `make_worker(k)` builds the mapping function run by worker `k`.
    pub fn new<M, F>(name: &str, make_worker: M, n: usize, capacity: usize, downstream: C) -> Result<Self>
    where
        M: Fn(usize) -> F,
        F: FnMut(In) -> Result<C::CallType> + Send + 'static,
    {
        let merge = MultiThreadedCallback::new(&format!("{}-merge", name), downstream, n, capacity)?;
        let mut workers = Vec::with_capacity(n);
        for (k, handle) in merge.into_iter().enumerate() {
            let map = MapCallback::new(make_worker(k), handle);
            workers.push(ThreadedCallback::new(&format!("{}-{}", name, k), map, capacity)?);
        }
        Ok(Self {
            split: SplitCallback::new(workers)?,
        })
    }

    pub fn workers(&self) -> usize {
        self.split.len()
    }
}

impl<In, C> CallFinish for FanOut<In, C>
where
    In: Send + 'static,
    C: CallFinish,
{
    type CallType = In;
    type ReturnType = C::ReturnType;

    fn call(&mut self, item: In) -> Result<()> {
        self.split.call(item)
    }

    fn finish(&mut self) -> Result<C::ReturnType> {
        self.split
            .finish()?
            .into_iter()
            .flatten()
            .flatten()
            .next()
            .ok_or_else(|| QtSortError::Pipeline("fan-out produced no result".to_string()))
    }
}

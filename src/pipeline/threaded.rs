//! Stages running their inner stage on a dedicated worker thread.

use super::callback::CallFinish;
use super::queue::BoundedQueue;
use crate::error::{QtSortError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// State shared by every handle of one stage and its worker.
pub(crate) struct Shared<T, R> {
    pub(crate) name: String,
    pub(crate) queues: Vec<BoundedQueue<T>>,
    error: Mutex<Option<QtSortError>>,
    remaining: AtomicUsize,
    worker: Mutex<Option<JoinHandle<Result<R>>>>,
}

impl<T, R> Shared<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(name: &str, queues: Vec<BoundedQueue<T>>, producers: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            queues,
            error: Mutex::new(None),
            remaining: AtomicUsize::new(producers),
            worker: Mutex::new(None),
        })
    }

    /// Start the worker thread, named after the stage. A panic in `body` is
    /// recorded as the stage's failure, releasing every blocked producer.
    pub(crate) fn spawn<F>(self: &Arc<Self>, body: F) -> Result<()>
    where
        F: FnOnce(Arc<Self>) -> Result<R> + Send + 'static,
    {
        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let worker = shared.clone();
                panic::catch_unwind(AssertUnwindSafe(move || body(worker))).unwrap_or_else(|p| {
                    Err(shared.fail(QtSortError::WorkerPanic(format!(
                        "{}: {}",
                        shared.name,
                        panic_message(p.as_ref())
                    ))))
                })
            })?;
        *self.worker.lock() = Some(handle);
        log::debug!("{}: worker started", self.name);
        Ok(())
    }
}

impl<T, R> Shared<T, R> {
    pub(crate) fn error(&self) -> Option<QtSortError> {
        self.error.lock().clone()
    }

    /// Record `err` unless an earlier failure was already recorded, cancel
    /// every queue, and return the recorded failure. A recorded cancellation
    /// gives way to the first real error, so callers see the root cause.
    pub(crate) fn fail(&self, err: QtSortError) -> QtSortError {
        let stored = {
            let mut slot = self.error.lock();
            let replace = match slot.as_ref() {
                None => true,
                Some(prev) => prev.is_cancelled() && !err.is_cancelled(),
            };
            if replace {
                if err.is_cancelled() {
                    log::warn!("{}: cancelled", self.name);
                } else {
                    log::error!("{}: {}", self.name, err);
                }
                *slot = Some(err);
            }
            slot.clone().unwrap_or(QtSortError::Cancelled)
        };
        for queue in &self.queues {
            queue.cancel();
        }
        stored
    }
}

impl<T, R> Shared<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Map a queue error to the stage's recorded failure, if there is one.
    pub(crate) fn queue_error(&self, err: QtSortError) -> QtSortError {
        self.error().unwrap_or(err)
    }

    fn join(&self) -> Result<R> {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Err(self.error().unwrap_or_else(|| {
                QtSortError::Pipeline(format!("{}: worker already joined", self.name))
            }));
        };
        match worker.join() {
            Ok(result) => {
                log::debug!("{}: worker finished", self.name);
                result
            }
            Err(panic) => Err(self.fail(QtSortError::WorkerPanic(format!(
                "{}: {}",
                self.name,
                panic_message(panic.as_ref())
            )))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Producer handle of a threaded stage.
///
/// Items passed to `call` are queued and handled by the inner stage on the
/// worker thread. A stage may have several handles, one per producer; the
/// worker sees the end of the stream only once every handle has called
/// `finish`. The last handle to finish joins the worker and receives
/// `Some(result)`, the others receive `None`.
///
/// If the inner stage fails, its first error is recorded and every later
/// `call` or `finish` on any handle returns that error. Dropping a handle
/// without calling `finish` cancels the stage.
///
/// ```rust
/// use qtsort::pipeline::{CallFinish, Collect, ThreadedCallback};
///
/// let mut stage = ThreadedCallback::new("collect", Collect::new(), 4)?;
/// for i in 0..10 {
///     stage.call(i)?;
/// }
/// let items = stage.finish()?.unwrap_or_default();
/// assert_eq!(items, (0..10).collect::<Vec<_>>());
/// # Ok::<(), qtsort::QtSortError>(())
/// ```
pub struct ThreadedCallback<T, R> {
    shared: Arc<Shared<T, R>>,
    slot: usize,
    finished: bool,
}

impl<T, R> ThreadedCallback<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// A single-producer stage.
    pub fn new<C>(name: &str, inner: C, capacity: usize) -> Result<Self>
    where
        C: CallFinish<CallType = T, ReturnType = R>,
    {
        let mut handles = Self::new_multi(name, inner, 1, capacity)?;
        handles
            .pop()
            .ok_or_else(|| QtSortError::Pipeline(format!("{}: no handle created", name)))
    }

    /// A stage fed by `producers` handles sharing one queue.
    pub fn new_multi<C>(name: &str, inner: C, producers: usize, capacity: usize) -> Result<Vec<Self>>
    where
        C: CallFinish<CallType = T, ReturnType = R>,
    {
        if producers == 0 {
            return Err(QtSortError::InvalidInput(format!(
                "{}: a stage needs at least one producer",
                name
            )));
        }
        let shared = Shared::new(name, vec![BoundedQueue::new(capacity)], producers);
        shared.spawn(move |shared| run_single(shared, inner))?;
        Ok((0..producers).map(|_| Self::from_shared(shared.clone(), 0)).collect())
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T, R>>, slot: usize) -> Self {
        Self {
            shared,
            slot,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Give up on the stage: record `err` as its failure and cancel it. The
    /// inner stage is dropped without being finished. Returns the recorded
    /// failure, which is an earlier one if the stage had already failed.
    pub fn abort(&mut self, err: QtSortError) -> QtSortError {
        self.finished = true;
        self.shared.fail(err)
    }
}

fn run_single<C>(
    shared: Arc<Shared<C::CallType, C::ReturnType>>,
    mut inner: C,
) -> Result<C::ReturnType>
where
    C: CallFinish,
{
    let queue = &shared.queues[0];
    while let Some(item) = queue.pop().map_err(|e| shared.queue_error(e))? {
        inner.call(item).map_err(|e| shared.fail(e))?;
    }
    inner.finish().map_err(|e| shared.fail(e))
}

impl<T, R> CallFinish for ThreadedCallback<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type CallType = T;
    type ReturnType = Option<R>;

    fn call(&mut self, item: T) -> Result<()> {
        if self.finished {
            return Err(QtSortError::QueueFinished);
        }
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        self.shared.queues[self.slot]
            .push(item)
            .map_err(|e| self.shared.queue_error(e))
    }

    fn finish(&mut self) -> Result<Option<R>> {
        if self.finished {
            return Err(QtSortError::QueueFinished);
        }
        self.finished = true;
        let last = self.shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
        let ended = if self.shared.queues.len() > 1 || last {
            self.shared.queues[self.slot].finish()
        } else {
            Ok(())
        };
        if last {
            return self.shared.join().map(Some);
        }
        ended.map_err(|e| self.shared.queue_error(e))?;
        match self.shared.error() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

impl<T, R> Drop for ThreadedCallback<T, R> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("{}: handle dropped before finish", self.shared.name);
        self.shared.fail(QtSortError::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::callback::{CallbackFn, Collect};
    use std::time::Duration;

    /// Stage that fails on a given item.
    struct FailAt {
        at: u32,
        seen: Vec<u32>,
    }

    impl CallFinish for FailAt {
        type CallType = u32;
        type ReturnType = Vec<u32>;

        fn call(&mut self, item: u32) -> Result<()> {
            if item == self.at {
                return Err(QtSortError::Structural(format!("bad item {}", item)));
            }
            self.seen.push(item);
            Ok(())
        }

        fn finish(&mut self) -> Result<Vec<u32>> {
            Ok(std::mem::take(&mut self.seen))
        }
    }

    #[test]
    fn test_single_producer_preserves_order() {
        let mut stage = ThreadedCallback::new("collect", Collect::new(), 2).unwrap();
        assert_eq!(stage.name(), "collect");
        for i in 0..1000 {
            stage.call(i).unwrap();
        }
        let items = stage.finish().unwrap().unwrap();
        assert_eq!(items, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_runs_on_named_thread() {
        let names = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = names.clone();
        let mut stage = ThreadedCallback::new(
            "named-stage",
            CallbackFn::new(move |_: u8| {
                sink.lock().push(thread::current().name().map(|s| s.to_string()));
                Ok(())
            }),
            1,
        )
        .unwrap();
        stage.call(1).unwrap();
        stage.finish().unwrap();
        assert_eq!(*names.lock(), vec![Some("named-stage".to_string())]);
    }

    #[test]
    fn test_multi_producer_last_finisher_gets_result() {
        let handles = ThreadedCallback::new_multi("sum", Collect::new(), 3, 4).unwrap();
        let workers: Vec<_> = handles
            .into_iter()
            .enumerate()
            .map(|(p, mut h)| {
                thread::spawn(move || {
                    for i in 0..100u32 {
                        h.call(p as u32 * 1000 + i).unwrap();
                    }
                    h.finish().unwrap()
                })
            })
            .collect();
        let results: Vec<Option<Vec<u32>>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        let mut items = results.into_iter().flatten().next().unwrap();
        assert_eq!(items.len(), 300);
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), 300);
    }

    #[test]
    fn test_end_seen_only_after_every_producer() {
        let mut handles = ThreadedCallback::new_multi("wait", Collect::new(), 2, 4).unwrap();
        let mut second = handles.pop().unwrap();
        let mut first = handles.pop().unwrap();
        first.call(1).unwrap();
        assert_eq!(first.finish().unwrap(), None);
        second.call(2).unwrap();
        assert_eq!(second.finish().unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn test_error_reported_to_every_caller() {
        let mut stage = ThreadedCallback::new(
            "failing",
            FailAt {
                at: 3,
                seen: Vec::new(),
            },
            1,
        )
        .unwrap();
        let mut first_err = None;
        for i in 0..100 {
            if let Err(e) = stage.call(i) {
                first_err = Some(e);
                break;
            }
        }
        // the error may surface on finish if every call was queued in time
        let finish_err = stage.finish().unwrap_err();
        assert!(matches!(finish_err, QtSortError::Structural(ref m) if m == "bad item 3"));
        if let Some(e) = first_err {
            assert_eq!(e.to_string(), finish_err.to_string());
        }
        assert!(matches!(stage.call(5), Err(QtSortError::QueueFinished)));
    }

    #[test]
    fn test_no_calls_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut stage = ThreadedCallback::new(
            "fail-fast",
            CallbackFn::new(move |x: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                if x == 10 {
                    return Err(QtSortError::InvalidInput("ten".into()));
                }
                Ok(())
            }),
            2,
        )
        .unwrap();
        for i in 0..100 {
            if stage.call(i).is_err() {
                break;
            }
        }
        assert!(stage.finish().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_multi_producer_error_shared() {
        let mut handles = ThreadedCallback::new_multi(
            "failing",
            FailAt {
                at: 0,
                seen: Vec::new(),
            },
            2,
            1,
        )
        .unwrap();
        let mut b = handles.pop().unwrap();
        let mut a = handles.pop().unwrap();
        a.call(0).unwrap();
        // wait for the worker to record the failure
        while a.shared.error().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(b.call(1), Err(QtSortError::Structural(_))));
        assert!(matches!(a.finish(), Err(QtSortError::Structural(_))));
        assert!(matches!(b.finish(), Err(QtSortError::Structural(_))));
    }

    #[test]
    fn test_drop_without_finish_cancels() {
        let mut handles = ThreadedCallback::new_multi("dropped", Collect::<u32>::new(), 2, 4).unwrap();
        let mut kept = handles.pop().unwrap();
        drop(handles);
        assert!(matches!(kept.call(1), Err(QtSortError::Cancelled)));
        assert!(matches!(kept.finish(), Err(QtSortError::Cancelled)));
    }

    #[test]
    fn test_worker_panic_surfaces() {
        let mut stage = ThreadedCallback::new(
            "panicking",
            CallbackFn::new(|x: u8| {
                if x == 1 {
                    panic!("boom");
                }
                Ok(())
            }),
            4,
        )
        .unwrap();
        stage.call(0).unwrap();
        let _ = stage.call(1);
        let err = stage.finish().unwrap_err();
        assert!(matches!(err, QtSortError::WorkerPanic(ref m) if m.contains("boom")));
    }

    #[test]
    fn test_worker_panic_releases_blocked_producer() {
        let mut stage = ThreadedCallback::new(
            "panic-first",
            CallbackFn::new(|x: u32| {
                if x == 0 {
                    panic!("first item");
                }
                Ok(())
            }),
            1,
        )
        .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let producer = thread::spawn(move || {
            let errors: Vec<QtSortError> = (0..10).filter_map(|i| stage.call(i).err()).collect();
            let finished = stage.finish();
            let _ = tx.send(());
            (errors, finished)
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("producer still blocked after the worker panicked");
        let (errors, finished) = producer.join().unwrap();
        assert!(!errors.is_empty());
        for err in errors {
            assert!(matches!(err, QtSortError::WorkerPanic(ref m) if m.contains("first item")));
        }
        assert!(matches!(finished, Err(QtSortError::WorkerPanic(_))));
    }

    #[test]
    fn test_failure_replaces_cancellation() {
        let shared: Arc<Shared<u8, ()>> = Shared::new("upgrade", vec![BoundedQueue::new(1)], 1);
        assert!(shared.fail(QtSortError::Cancelled).is_cancelled());
        let err = shared.fail(QtSortError::InvalidInput("root".into()));
        assert!(matches!(err, QtSortError::InvalidInput(_)));
        let err = shared.fail(QtSortError::Structural("later".into()));
        assert!(matches!(err, QtSortError::InvalidInput(_)));
        assert!(matches!(shared.fail(QtSortError::Cancelled), QtSortError::InvalidInput(_)));
    }

    #[test]
    fn test_abort_skips_inner_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        struct CountFinish(Arc<AtomicUsize>);
        impl CallFinish for CountFinish {
            type CallType = u8;
            type ReturnType = ();
            fn call(&mut self, _: u8) -> Result<()> {
                Ok(())
            }
            fn finish(&mut self) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let mut stage = ThreadedCallback::new("aborted", CountFinish(finished.clone()), 2).unwrap();
        stage.call(1).unwrap();
        let err = stage.abort(QtSortError::InvalidInput("stop".into()));
        assert!(matches!(err, QtSortError::InvalidInput(_)));
        assert!(matches!(stage.call(2), Err(QtSortError::QueueFinished)));
        drop(stage);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_producers_rejected() {
        assert!(ThreadedCallback::new_multi("none", Collect::<u8>::new(), 0, 1).is_err());
    }
}

//! Concurrent pipeline primitives.
//!
//! A pipeline is a chain of [`CallFinish`] stages, each owning the next.
//! Threaded stages put a [`BoundedQueue`] and a worker thread between a
//! producer and its downstream, so a slow stage applies back-pressure to the
//! stages feeding it. Failures cancel the queues of the failing stage, which
//! unblocks every thread waiting on them.

pub mod callback;
pub mod multi;
pub mod observer;
pub mod queue;
pub mod threaded;

pub use callback::{CallFinish, CallbackFn, Collect, MapCallback, SplitCallback};
pub use multi::{FanOut, MultiThreadedCallback};
pub use observer::{LogObserver, ProgressObserver, SharedObserver};
pub use queue::BoundedQueue;
pub use threaded::ThreadedCallback;

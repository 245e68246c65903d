//! Progress reporting hooks.
//!
//! Long-running stages report progress through an optional observer passed
//! in at construction. Leaving it out changes what is visible, never what is
//! computed.

use std::sync::Arc;

pub trait ProgressObserver: Send + Sync {
    /// A one-off status message.
    fn message(&self, msg: &str);

    /// A message tied to an overall completion percentage.
    fn progress(&self, percent: f64, msg: &str) {
        let _ = percent;
        self.message(msg);
    }
}

pub type SharedObserver = Arc<dyn ProgressObserver>;

/// Observer forwarding everything to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn message(&self, msg: &str) {
        log::info!("{}", msg);
    }

    fn progress(&self, percent: f64, msg: &str) {
        log::info!("[{:5.1}%] {}", percent, msg);
    }
}

/// Send a message if an observer is attached. The message is only built
/// when someone will see it.
pub(crate) fn notify<F>(observer: &Option<SharedObserver>, msg: F)
where
    F: FnOnce() -> String,
{
    if let Some(obs) = observer {
        obs.message(&msg());
    }
}

pub(crate) fn notify_progress<F>(observer: &Option<SharedObserver>, percent: f64, msg: F)
where
    F: FnOnce() -> String,
{
    if let Some(obs) = observer {
        obs.progress(percent, &msg());
    }
}

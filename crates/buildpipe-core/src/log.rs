//! Unified build log: a fan-out sink for line-tagged log records.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Which stream a log line originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// An observer is any `Fn(stream, line)` callback subscribed to a
/// [`BuildLog`]. Observers are invoked synchronously in registration order,
/// so a single `log()` call completes before the next is observed — there
/// is no interleaving between separate calls.
pub type LogObserver = Arc<dyn Fn(LogStream, &str) + Send + Sync>;

/// Fan-out sink shared by a [`crate::pipeline::Pipeline`] and every stage it
/// has attached. The pipeline installs itself as the sole observer on each
/// stage at attachment time and re-fans every line out to its own observer
/// set, so producers (stages) never need to know how many consumers exist.
#[derive(Default)]
pub struct BuildLog {
    observers: Mutex<Vec<LogObserver>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe an observer. Returns nothing removable by design — the
    /// teacher's own `PipelineOrchestrator` uses a similar fire-and-forget
    /// mpsc channel for `PipelineEvent`; observers here live as long as the
    /// `BuildLog` itself.
    pub fn subscribe(&self, observer: LogObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Fan a line out to every observer, in registration order.
    pub fn log(&self, stream: LogStream, line: &str) {
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer(stream, line);
        }
    }
}

impl fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.observers.lock().unwrap().len();
        f.debug_struct("BuildLog").field("observers", &n).finish()
    }
}

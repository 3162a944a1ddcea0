//! Per-request callbacks and the worker that runs them.
//!
//! User callbacks never run on the read loop. Dispatch hands them to a
//! [`CallbackRunner`], a dedicated thread that invokes them in arrival order
//! under `catch_unwind`. A callback that panics is logged and forgotten; one
//! that blocks only delays later callbacks, never frame parsing or reply
//! resolution.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use serde_json::Value;
use tracing::{debug, error, trace};

/// A user notification hook. Receives the full message object.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Optional progress and message hooks attached to one request.
#[derive(Clone, Default)]
pub struct RequestCallbacks {
    on_progress: Option<Callback>,
    on_message: Option<Callback>,
}

impl RequestCallbacks {
    /// Creates an empty set of callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: called for every `progress` message of the request.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Builder: called for every `message` message of the request.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn progress(&self) -> Option<&Callback> {
        self.on_progress.as_ref()
    }

    pub fn message(&self) -> Option<&Callback> {
        self.on_message.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.on_progress.is_none() && self.on_message.is_none()
    }
}

impl fmt::Debug for RequestCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

struct Job {
    kind: &'static str,
    callback: Callback,
    message: Value,
}

/// Runs callbacks on a dedicated thread.
///
/// The thread exits once the runner is dropped and its queue is drained.
pub(crate) struct CallbackRunner {
    jobs: mpsc::Sender<Job>,
}

impl CallbackRunner {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("cmakeserver-callbacks".to_string())
            .spawn(move || {
                while let Ok(job) = queue.recv() {
                    invoke(job.kind, &job.callback, &job.message);
                }
                debug!("callback runner stopped");
            })?;
        Ok(Self { jobs })
    }

    /// Queues a callback invocation. Never blocks.
    pub(crate) fn submit(&self, kind: &'static str, callback: Callback, message: Value) {
        let job = Job {
            kind,
            callback,
            message,
        };
        if self.jobs.send(job).is_err() {
            error!(kind, "callback runner is gone, dropping notification");
        }
    }
}

/// Invokes a callback, containing any panic. Returns false if it panicked.
pub(crate) fn invoke(kind: &'static str, callback: &Callback, message: &Value) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(message))) {
        Ok(()) => {
            trace!(kind, "callback done");
            true
        }
        Err(panic) => {
            error!(kind, panic = %panic_message(panic.as_ref()), "callback panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

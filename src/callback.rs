//! Serialised delivery of user-visible callbacks.
//!
//! Every delegate notification and client method handler runs on a
//! [`CallbackQueue`] so that user code never executes while an internal
//! lock is held, and so that callbacks for one connection are observed in
//! the order they were produced.

use futures_channel::mpsc;
use futures_util::StreamExt;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO executor for user-visible callbacks.
///
/// Cloning the queue yields another handle onto the same drain task, so a
/// connection and its adapters share one delivery order.
#[derive(Clone)]
pub struct CallbackQueue {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Creates a queue and spawns its drain task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (jobs, mut rx) = mpsc::unbounded::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.next().await {
                job();
            }
        });
        Self { jobs }
    }

    /// Schedules `job` to run after everything already queued.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // A send error means the runtime is shutting down; the callback is
        // dropped along with everything else.
        let _ = self.jobs.unbounded_send(Box::new(job));
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

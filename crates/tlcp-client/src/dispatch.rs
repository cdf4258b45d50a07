//! Callback queue: runs listener notifications outside the engine lock.
//!
//! Jobs are delivered in enqueue order on a single consumer, either a
//! dedicated dispatcher thread or the caller of [`CallbackQueue::drain`].
//! A panicking listener is caught and logged; later jobs still run.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to the callback queue.
#[derive(Clone)]
pub struct CallbackQueue {
    tx: Sender<Job>,
    manual: Option<Receiver<Job>>,
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("manual", &self.manual.is_some())
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl CallbackQueue {
    /// Start a dispatcher thread named `name`. The thread exits once every
    /// handle to the queue is dropped.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in rx.iter() {
                run_job(job);
            }
            tracing::trace!("callback dispatcher stopped");
        })?;
        Ok(Self { tx, manual: None })
    }

    /// Queue whose jobs run only on [`drain`](Self::drain).
    pub fn manual() -> Self {
        let (tx, rx) = unbounded::<Job>();
        Self {
            tx,
            manual: Some(rx),
        }
    }

    /// Whether jobs wait for [`drain`](Self::drain).
    pub fn is_manual(&self) -> bool {
        self.manual.is_some()
    }

    /// Queue a job.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::warn!("callback dispatcher is gone, dropping notification");
        }
    }

    /// Run every queued job on the calling thread. Returns the number of
    /// jobs run; always 0 for a threaded queue.
    pub fn drain(&self) -> usize {
        let Some(rx) = &self.manual else {
            return 0;
        };
        let mut n = 0;
        while let Ok(job) = rx.try_recv() {
            run_job(job);
            n += 1;
        }
        n
    }

    /// Wait until every job queued so far has run.
    ///
    /// Must not be called from inside a listener callback on a threaded
    /// queue: the dispatcher would wait for itself.
    pub fn flush(&self) {
        if self.is_manual() {
            self.drain();
            return;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        self.enqueue(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }
}

fn run_job(job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!(%reason, "listener callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn manual_queue_runs_in_order_on_drain() {
        let queue = CallbackQueue::manual();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            queue.enqueue(move || seen.lock().push(i));
        }
        assert!(seen.lock().is_empty());
        assert_eq!(queue.drain(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panics_do_not_stop_the_queue() {
        let queue = CallbackQueue::manual();
        let seen = Arc::new(Mutex::new(0));
        queue.enqueue(|| panic!("listener bug"));
        let s = seen.clone();
        queue.enqueue(move || *s.lock() += 1);
        assert_eq!(queue.drain(), 2);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn threaded_queue_flushes() {
        let queue = CallbackQueue::spawn("test-callbacks").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            queue.enqueue(move || seen.lock().push(i));
        }
        queue.flush();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(queue.drain(), 0);
    }
}

//! Hand-off of work onto the simulation thread.
//!
//! Worker tasks (blob loads, network readers) never touch observer-visible
//! state directly. They post a job through a [`DispatchHandle`]; the
//! simulation thread runs queued jobs in order when it calls
//! [`Dispatcher::pump`], so feed callbacks never run concurrently with each
//! other or with `submit`.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Unit of work queued for the simulation thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Simulation-thread end of the job queue
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Cloneable sender usable from any thread
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle { tx: self.tx.clone() }
    }

    /// Run every queued job, including jobs queued by jobs run here.
    ///
    /// Returns how many jobs ran.
    pub fn pump(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Keep pumping until `done` holds or `timeout` passes.
    ///
    /// Returns whether `done` was reached.
    pub fn pump_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender half handed to worker tasks
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl DispatchHandle {
    /// Queue `job` for the simulation thread.
    ///
    /// Returns `false` if the dispatcher is gone; the job is dropped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_in_post_order() {
        let mut dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            handle.post(move || log.lock().unwrap().push(i));
        }

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(dispatcher.pump(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_pump_until_waits_for_worker() {
        let mut dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert!(dispatcher.pump_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 1));
        worker.join().unwrap();
    }

    #[test]
    fn test_post_after_drop_reports_failure() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        drop(dispatcher);
        assert!(!handle.post(|| {}));
    }
}

use log::{debug, error};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of background threads draining one FIFO job queue.
///
/// Jobs run in submission order. Dropping the pool lets queued jobs finish and
/// joins every worker.
pub struct DecodeWorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodeWorkerPool {
    pub fn new(threads: usize, name: &str) -> io::Result<Self> {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || Self::worker_thread(receiver))?;
            workers.push(handle);
        }
        debug!("Started {} decode workers", workers.len());

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a job. Returns false if the pool is shutting down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };
        sender.send(Box::new(job)).is_ok()
    }

    fn worker_thread(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let Ok(receiver) = receiver.lock() else {
                    return;
                };
                receiver.recv()
            };
            let Ok(job) = job else {
                return;
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Decode worker job panicked");
            }
        }
    }
}

impl Drop for DecodeWorkerPool {
    fn drop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Decode worker exited with a panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs_on_named_threads() {
        let pool = DecodeWorkerPool::new(2, "test-decode").unwrap();
        let (sender, receiver) = mpsc::channel();
        for i in 0..8 {
            let sender = sender.clone();
            assert!(pool.execute(move || {
                let name = thread::current().name().unwrap_or_default().to_string();
                sender.send((i, name)).unwrap();
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let (i, name) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.starts_with("test-decode-"));
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = DecodeWorkerPool::new(1, "test-panic").unwrap();
        pool.execute(|| panic!("boom"));
        let (sender, receiver) = mpsc::channel();
        pool.execute(move || sender.send(42).unwrap());
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = DecodeWorkerPool::new(1, "test-drain").unwrap();
            for _ in 0..5 {
                let counter = counter.clone();
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}

//! Worker-thread pool for deferred callback execution.
//!
//! Application callbacks and the multiplexer's own re-arming dispatch task
//! all run here, never on the thread that triggered them and never inside a
//! socket's internal lock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Scheduler {
    tx: Mutex<Option<flume::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// `threads == 0` sizes the pool to the CPU count.
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let (tx, rx) = flume::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("reactnet-worker-{i}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues a task. Returns false after shutdown.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match &*self.tx.lock() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Closes the queue and joins the workers. Must not be called from a
    /// worker thread.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_on_pool() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::unbounded();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            assert!(scheduler.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }
        for _ in 0..10 {
            rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        scheduler.shutdown();
        assert!(!scheduler.spawn(|| {}));
    }
}

//! Fixed-size worker pool for class-level decompilation jobs.
//!
//! `execute` enqueues without blocking; `join` blocks until every enqueued
//! job has finished, after which the pool can keep accepting work. Jobs own
//! their scratch (expression arenas and decode buffers) and drop it on the
//! way out, so nothing a task allocates survives the task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Clamping of the requested worker count: 0 means "default of 4", below
/// two collapses to single-threaded, sixteen is the ceiling.
pub fn clamp_workers(requested: usize) -> usize {
    if requested == 0 {
        4
    } else if requested < 2 {
        1
    } else if requested > 16 {
        16
    } else {
        requested
    }
}

struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    sender: Option<Sender<Job>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    /// Spawns `workers` OS threads (callers clamp beforehand via
    /// [`clamp_workers`]).
    pub fn new(workers: usize) -> WorkerPool {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            done: Condvar::new(),
        });

        let next_id = AtomicUsize::new(0);
        let handles = (0..workers)
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let pending = Arc::clone(&pending);
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker_loop(id, &receiver, &pending))
                    .expect("spawning a pool worker")
            })
            .collect();

        WorkerPool {
            workers: handles,
            sender: Some(sender),
            pending,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a job; never blocks.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        {
            let mut count = self.pending.count.lock().unwrap();
            *count += 1;
        }
        self.sender
            .as_ref()
            .expect("pool is alive")
            .send(Box::new(job))
            .expect("pool workers are alive");
    }

    /// Blocks until every enqueued job has completed.
    pub fn join(&self) {
        let mut count = self.pending.count.lock().unwrap();
        while *count > 0 {
            count = self.pending.done.wait(count).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, receiver: &Mutex<Receiver<Job>>, pending: &Pending) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap();
            receiver.recv()
        };
        match job {
            Ok(job) => {
                job();
                let mut count = pending.count.lock().unwrap();
                *count -= 1;
                if *count == 0 {
                    pending.done.notify_all();
                }
            }
            Err(_) => {
                debug!("worker-{id} shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn clamping() {
        let cases = vec![(0, 4), (1, 1), (2, 2), (8, 8), (16, 16), (17, 16), (100, 16)];
        for (requested, expected) in cases {
            assert_eq!(clamp_workers(requested), expected);
        }
    }

    #[test]
    fn executes_all_jobs_before_join_returns() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn join_on_idle_pool_returns() {
        let pool = WorkerPool::new(2);
        pool.join();
    }

    #[test]
    fn pool_is_reusable_after_join() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for round in 0..3 {
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.join();
            assert_eq!(counter.load(Ordering::SeqCst), (round + 1) * 10);
        }
    }

    #[test]
    fn single_worker_runs_in_order() {
        let pool = WorkerPool::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            pool.execute(move || {
                log.lock().unwrap().push(i);
            });
        }
        pool.join();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}

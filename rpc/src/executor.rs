//! A small worker pool for jobs that are allowed to block.
//!
//! The reactors use one of these for connection negotiation, which performs
//! blocking socket I/O and therefore must never run on a loop thread.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tracing::debug;

use crate::error::{Result, RpcError};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ThreadPool {
    name: String,
    queue_len: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Dropped on shutdown to disconnect the workers.
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(
        name: &str,
        num_threads: usize,
        queue_len: usize,
    ) -> std::io::Result<ThreadPool> {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(queue_len);
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(ThreadPool {
            name: name.to_string(),
            queue_len,
            inner: Mutex::new(PoolInner {
                tx: Some(tx),
                workers,
            }),
        })
    }

    /// Hand a job to the pool.
    ///
    /// Fails with `IllegalState` once shutdown has begun, or with
    /// `ServiceUnavailable` when the job queue is at capacity.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let tx = match self.inner.lock().tx.as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(self.closing_error()),
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RpcError::service_unavailable(format!(
                "{} pool queue is full ({} entries)",
                self.name, self.queue_len
            ))),
            Err(TrySendError::Disconnected(_)) => Err(self.closing_error()),
        }
    }

    /// Stop accepting jobs, let queued jobs run, and join the workers.
    /// Idempotent.
    pub(crate) fn shutdown(&self) {
        let workers = {
            let mut inner = self.inner.lock();
            if inner.tx.take().is_none() {
                return;
            }
            std::mem::take(&mut inner.workers)
        };
        debug!("{} pool shutting down ({} workers)", self.name, workers.len());
        for handle in workers {
            let _ = handle.join();
        }
    }

    fn closing_error(&self) -> RpcError {
        RpcError::illegal_state(format!("{} pool is shutting down", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run() {
        let pool = ThreadPool::new("test", 2, 64).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = count.clone();
            pool.submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_submit_after_shutdown_is_illegal_state() {
        let pool = ThreadPool::new("test", 1, 64).unwrap();
        pool.shutdown();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(err.is_illegal_state());
        assert!(err.to_string().contains("shutting down"));
    }

    #[test]
    fn test_submit_to_full_queue_is_service_unavailable() {
        // No workers, so nothing drains: the third job has nowhere to go.
        let pool = ThreadPool::new("test", 0, 2).unwrap();
        pool.submit(Box::new(|| {})).unwrap();
        pool.submit(Box::new(|| {})).unwrap();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(err.is_service_unavailable());
        assert!(err.to_string().contains("queue is full"));
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let pool = ThreadPool::new("test", 1, 64).unwrap();
        pool.shutdown();
        pool.shutdown();
    }
}

//! Bounded worker pool with caller-runs overflow
//!
//! Each dispatch loop owns one pool. Jobs go through a bounded queue to
//! `core` long-lived workers. When the queue is full the pool grows up to
//! `max` workers; extra workers retire after sitting idle. Once the pool is
//! at `max` and the queue is still full, the submitting thread runs the job
//! itself, which slows the event loop down instead of dropping work or
//! queueing without bound.

use crate::network::error::NodeError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long an above-core worker waits for work before retiring
pub const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(30);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of job threads
pub struct WorkerPool {
    name: String,
    core: usize,
    max: usize,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    keep_alive: Duration,
    live: Arc<AtomicUsize>,
    caller_runs: AtomicU64,
}

impl WorkerPool {
    /// Start `core` workers; the pool may grow to `max` when `backlog` fills
    pub fn new(name: impl Into<String>, core: usize, max: usize, backlog: usize) -> Result<Self, NodeError> {
        let core = core.max(1);
        let max = max.max(core);
        let (sender, receiver) = channel::bounded(backlog.max(1));
        let pool = Self {
            name: name.into(),
            core,
            max,
            sender: Mutex::new(Some(sender)),
            receiver,
            handles: Mutex::new(Vec::with_capacity(max)),
            keep_alive: WORKER_KEEP_ALIVE,
            live: Arc::new(AtomicUsize::new(0)),
            caller_runs: AtomicU64::new(0),
        };
        for _ in 0..core {
            pool.live.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None, false)?;
        }
        Ok(pool)
    }

    /// Idle time after which above-core workers retire
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Submit a job; returns `PoolClosed` after [`WorkerPool::shutdown`]
    pub fn execute<F>(&self, job: F) -> Result<(), NodeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NodeError::PoolClosed)?;

        let job = match sender.try_send(Box::new(job)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => return Err(NodeError::PoolClosed),
            Err(TrySendError::Full(job)) => job,
        };

        if self.reserve_extra_worker() {
            if let Err(e) = self.spawn_worker(Some(job), true) {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
            return Ok(());
        }

        self.caller_runs.fetch_add(1, Ordering::Relaxed);
        log::debug!("{} saturated, running job on the caller", self.name);
        run_job(&self.name, job);
        Ok(())
    }

    /// Refuse new jobs; queued and running jobs still complete
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Shut down and wait for every worker to exit
    pub fn join(&self) {
        self.shutdown();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("{} worker panicked outside a job", self.name);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Workers currently alive
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Jobs executed on the submitting thread because the pool was saturated
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::Relaxed)
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.core, self.max)
    }

    #[cfg(test)]
    fn tracked_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn reserve_extra_worker(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn spawn_worker(&self, first: Option<Job>, extra: bool) -> Result<(), NodeError> {
        let receiver = self.receiver.clone();
        let live = Arc::clone(&self.live);
        let name = self.name.clone();
        let core = self.core;
        let keep_alive = self.keep_alive;

        let handle = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || {
                if let Some(job) = first {
                    run_job(&name, job);
                }
                loop {
                    let job = if extra {
                        match receiver.recv_timeout(keep_alive) {
                            Ok(job) => job,
                            Err(RecvTimeoutError::Timeout) => {
                                let retired = live
                                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                        (n > core).then(|| n - 1)
                                    })
                                    .is_ok();
                                if retired {
                                    return;
                                }
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    } else {
                        match receiver.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    run_job(&name, job);
                }
                live.fetch_sub(1, Ordering::SeqCst);
            })?;

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        // Retired extra workers have already exited.
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_job(pool: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("Job panicked in {}", pool);
    }
}

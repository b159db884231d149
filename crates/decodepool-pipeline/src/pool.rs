//! Fixed-size decode worker pool.
//!
//! Each worker owns one [`Decoder`] for its whole life. Tasks are queued
//! with [`ThreadPool::add_task`] and dispatched by [`ThreadPool::run_all`];
//! workers pop tasks one at a time under the pool lock and decode with the
//! lock released. The batch is complete when the queue is empty and no task
//! is in flight.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use decodepool_core::{DecodeError, MemoryPadding, Result, TaskFailure};
use decodepool_decode::{CodecFactory, DecodePath, Decoder};
use decodepool_gpu::DeviceContext;

use crate::task::DecodeTask;

/// Lifecycle of a pool. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Idle,
    Running,
    ShutDown,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub num_threads: usize,
    pub state: PoolState,
    pub queued: usize,
    pub outstanding: usize,
    pub batches: u64,
    pub hardware_decoded: u64,
    /// Images that went through the software path.
    pub software_decoded: u64,
    /// Images the hardware path handed over to software.
    pub fallbacks: u64,
    pub failed: u64,
}

struct Inner {
    state: PoolState,
    queue: VecDeque<DecodeTask>,
    /// Tasks popped by a worker and not yet finished.
    outstanding: usize,
    failures: Vec<TaskFailure>,
    batch_total: usize,
    batch_started: Option<Instant>,
    batches: u64,
    hardware_decoded: u64,
    software_decoded: u64,
    fallbacks: u64,
    failed: u64,
}

impl Inner {
    fn batch_finished(&self) -> bool {
        self.outstanding == 0 && self.queue.is_empty()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when tasks become runnable or the pool shuts down.
    work_ready: Condvar,
    /// Signalled when a batch completes or the pool shuts down.
    batch_done: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
    ctx: Arc<DeviceContext>,
}

impl ThreadPool {
    /// Start `num_threads` workers, each building its own decoder from
    /// `factory` on its own thread. Returns once every decoder is ready, or
    /// the first construction error after stopping the workers that started.
    pub fn new(
        num_threads: usize,
        ctx: Arc<DeviceContext>,
        factory: Option<Arc<dyn CodecFactory>>,
        padding: MemoryPadding,
    ) -> Result<Self> {
        if num_threads == 0 {
            return Err(DecodeError::InvalidConfig(
                "decode pool needs at least one thread".into(),
            ));
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: PoolState::Idle,
                queue: VecDeque::new(),
                outstanding: 0,
                failures: Vec::new(),
                batch_total: 0,
                batch_started: None,
                batches: 0,
                hardware_decoded: 0,
                software_decoded: 0,
                fallbacks: 0,
                failed: 0,
            }),
            work_ready: Condvar::new(),
            batch_done: Condvar::new(),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads,
            ctx,
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        for worker_id in 0..num_threads {
            let shared = pool.shared.clone();
            let ctx = pool.ctx.clone();
            let factory = factory.clone();
            let ready = ready_tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("decodepool-worker-{worker_id}"))
                .spawn(move || {
                    let decoder = match Decoder::new(ctx, factory.as_deref(), padding) {
                        Ok(decoder) => {
                            let _ = ready.send(Ok(()));
                            decoder
                        }
                        Err(e) => {
                            let _ = ready.send(Err(e));
                            return;
                        }
                    };
                    drop(ready);
                    worker_loop(worker_id, &shared, decoder);
                });

            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }
        drop(ready_tx);

        for _ in 0..num_threads {
            let ready = ready_rx.recv().unwrap_or_else(|_| {
                Err(DecodeError::Codec("decode worker exited during startup".into()))
            });
            if let Err(e) = ready {
                tracing::error!(error = %e, "decode worker failed to start");
                pool.shutdown();
                return Err(e);
            }
        }

        tracing::info!(
            threads = num_threads,
            device = pool.ctx.device_ordinal(),
            codec = factory.as_ref().map(|f| f.name()).unwrap_or("none"),
            "decode pool started"
        );

        Ok(pool)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Append a task. No worker is woken here; an idle pool starts it on
    /// the next `run_all`.
    ///
    /// While a batch is running, the task joins that batch and is picked up
    /// by the next worker that finishes its current task.
    pub fn add_task(&self, task: DecodeTask) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        match state {
            PoolState::ShutDown => return Err(DecodeError::PoolShutDown),
            PoolState::Running => inner.batch_total += 1,
            PoolState::Idle => {}
        }
        inner.queue.push_back(task);
        Ok(())
    }

    /// Dispatch every queued task, optionally largest first, and with
    /// `wait` block until the batch completes.
    ///
    /// A completed batch with failed tasks returns [`DecodeError::Batch`];
    /// the slots of the successful tasks are populated regardless.
    pub fn run_all(&self, wait: bool, sort: bool) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == PoolState::ShutDown {
                return Err(DecodeError::PoolShutDown);
            }

            if sort {
                sort_longest_first(&mut inner.queue);
            }

            if inner.state == PoolState::Idle {
                inner.failures.clear();
                inner.batch_total = inner.queue.len();
            }
            if inner.queue.is_empty() && inner.outstanding == 0 {
                return Ok(());
            }

            inner.state = PoolState::Running;
            inner.batch_started.get_or_insert_with(Instant::now);

            tracing::debug!(
                tasks = inner.queue.len(),
                sorted = sort,
                threads = self.num_threads,
                "dispatching decode batch"
            );
            self.shared.work_ready.notify_all();
        }

        if wait {
            self.wait()
        } else {
            Ok(())
        }
    }

    /// Block until the running batch completes. Returns immediately when no
    /// batch is running.
    pub fn wait(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        while inner.state == PoolState::Running {
            self.shared.batch_done.wait(&mut inner);
        }
        if inner.state == PoolState::ShutDown {
            return Err(DecodeError::PoolShutDown);
        }

        if inner.failures.is_empty() {
            return Ok(());
        }
        let mut failures = std::mem::take(&mut inner.failures);
        failures.sort_by_key(|f| f.index);
        Err(DecodeError::Batch {
            failures,
            total: inner.batch_total,
        })
    }

    /// Stop the workers and drop queued tasks. Tasks already being decoded
    /// finish first. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let dropped = {
            let mut inner = self.shared.inner.lock();
            let dropped = inner.queue.len();
            inner.queue.clear();
            inner.state = PoolState::ShutDown;
            self.shared.work_ready.notify_all();
            self.shared.batch_done.notify_all();
            dropped
        };

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        let joined = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!("decode worker exited by panic");
            }
        }
        tracing::info!(workers = joined, dropped_tasks = dropped, "decode pool shut down");
    }

    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().state
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            num_threads: self.num_threads,
            state: inner.state,
            queued: inner.queue.len(),
            outstanding: inner.outstanding,
            batches: inner.batches,
            hardware_decoded: inner.hardware_decoded,
            software_decoded: inner.software_decoded,
            fallbacks: inner.fallbacks,
            failed: inner.failed,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("state", &self.state())
            .finish()
    }
}

fn worker_loop(worker_id: usize, shared: &Shared, mut decoder: Decoder) {
    loop {
        let task = {
            let mut inner = shared.inner.lock();
            loop {
                let state = inner.state;
                match state {
                    PoolState::ShutDown => return,
                    PoolState::Running if !inner.queue.is_empty() => break,
                    _ => shared.work_ready.wait(&mut inner),
                }
            }
            let Some(task) = inner.queue.pop_front() else {
                continue;
            };
            inner.outstanding += 1;
            task
        };

        let index = task.index();
        let fallbacks_before = decoder.stats().fallbacks;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            decoder.run(task.data(), task.output(), index, task.roi(), task.space())
        }));
        // Release the input and output references before reporting
        // completion, so a waiter sees the batch without extra owners.
        drop(task);

        let result = match result {
            Ok(result) => result,
            Err(payload) => Err(DecodeError::TaskPanicked {
                index,
                message: panic_message(payload.as_ref()),
            }),
        };

        let fallbacks = decoder.stats().fallbacks - fallbacks_before;

        let mut inner = shared.inner.lock();
        inner.outstanding -= 1;
        inner.fallbacks += fallbacks;
        match result {
            Ok(DecodePath::Hardware) => inner.hardware_decoded += 1,
            Ok(DecodePath::Software) => inner.software_decoded += 1,
            Err(error) => {
                tracing::error!(worker = worker_id, index, %error, "decode task failed");
                metrics::counter!("decodepool_task_failures_total").increment(1);
                inner.failed += 1;
                inner.failures.push(TaskFailure { index, error });
            }
        }

        if inner.state == PoolState::Running && inner.batch_finished() {
            inner.state = PoolState::Idle;
            inner.batches += 1;
            if let Some(started) = inner.batch_started.take() {
                let elapsed = started.elapsed();
                metrics::histogram!("decodepool_batch_seconds").record(elapsed.as_secs_f64());
                tracing::debug!(
                    tasks = inner.batch_total,
                    failed = inner.failures.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "decode batch complete"
                );
            }
            shared.batch_done.notify_all();
        }
    }
}

/// Stable, so equal-length tasks keep submission order.
fn sort_longest_first(queue: &mut VecDeque<DecodeTask>) {
    queue
        .make_contiguous()
        .sort_by(|a, b| b.len().cmp(&a.len()));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

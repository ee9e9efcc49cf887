//! Bounded-concurrency execution of many download tasks
//!
//! A [`Batch`] runs one feeder task and a fixed pool of workers:
//!
//! ```text
//! tasks stream ──► feeder ──► work queue (cap = backlog) ──► C workers
//!                    │                                          │
//!                    └──── End{total} / Fatal ──► results ◄─────┘ Item(Plan)
//! ```
//!
//! The feeder attaches the run's [`SharedContext`] to each task, wraps it in a
//! [`Plan`] and pushes it onto the work queue; a full queue blocks the feeder
//! (backpressure). Workers execute plans and publish them on the results
//! channel in completion order. [`BatchResults::next`] yields plans until the
//! published total has been reached.

use super::context::SharedContext;
use super::task::DownloadTask;
use crate::error::{Error, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default number of concurrent downloads
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of plans admitted before the feeder blocks
pub const DEFAULT_BACKLOG: usize = 1024;

/// Execution wrapper around one [`DownloadTask`]
///
/// Executing a plan never fails: the task's error is captured and surfaced by
/// [`Plan::result`], so a per-task failure is never confused with a failure of
/// the batch itself.
#[derive(Debug)]
pub struct Plan {
    task: DownloadTask,
    executed: bool,
    error: Option<Error>,
}

impl Plan {
    /// Wrap a task
    pub fn new(task: DownloadTask) -> Self {
        Self {
            task,
            executed: false,
            error: None,
        }
    }

    /// Execute the task, capturing its error (or panic)
    pub async fn execute(&mut self) {
        let outcome = AssertUnwindSafe(self.task.execute()).catch_unwind().await;
        self.executed = true;
        self.error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(url = %self.task.url(), panic = %message, "download task panicked");
                Some(Error::Other(format!("download task panicked: {}", message)))
            }
        };
    }

    /// The wrapped task
    pub fn task(&self) -> &DownloadTask {
        &self.task
    }

    /// Whether [`execute`](Self::execute) ran
    pub fn executed(&self) -> bool {
        self.executed
    }

    /// The captured error, if the task failed
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether the task ran and succeeded
    pub fn succeeded(&self) -> bool {
        self.executed && self.error.is_none()
    }

    /// The task, or the error it failed with
    pub fn result(self) -> Result<DownloadTask> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.task),
        }
    }

    /// Split into the task and its captured error
    pub fn into_parts(self) -> (DownloadTask, Option<Error>) {
        (self.task, self.error)
    }
}

/// Message published on the results channel
#[derive(Debug)]
pub enum BatchMessage {
    /// A finished plan
    Item(Plan),
    /// The task stream failed; the run cannot make progress
    Fatal(Error),
    /// The feeder is done; `total` plans were submitted
    End {
        /// Number of submitted plans
        total: usize,
    },
}

/// Bounded-concurrency download run
pub struct Batch {
    tasks: Option<BoxStream<'static, Result<DownloadTask>>>,
    concurrency: usize,
    backlog: usize,
    context: SharedContext,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Batch {
    /// Create a run over `tasks`
    ///
    /// Fails when `concurrency < 2` or `backlog < concurrency`.
    pub fn new<S>(tasks: S, concurrency: usize, backlog: usize) -> Result<Self>
    where
        S: Stream<Item = Result<DownloadTask>> + Send + 'static,
    {
        if concurrency < 2 {
            return Err(Error::config("concurrency", "concurrency may not be < 2"));
        }
        if backlog < concurrency {
            return Err(Error::config("backlog", "backlog may not be < concurrency"));
        }

        Ok(Self {
            tasks: Some(tasks.boxed()),
            concurrency,
            backlog,
            context: SharedContext::new(),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Share `context` instead of a fresh one
    pub fn with_context(mut self, context: SharedContext) -> Self {
        self.context = context;
        self
    }

    /// Stop this run when `parent` is cancelled
    ///
    /// The batch works on a child token, so shutting the batch down never
    /// cancels `parent`.
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    /// The run's shared context
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Worker count
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Admission queue size
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Start the feeder and workers, returning the completion-ordered results
    ///
    /// A batch runs once; a second call fails.
    pub fn download(&mut self) -> Result<BatchResults> {
        let tasks = self
            .tasks
            .take()
            .ok_or_else(|| Error::Other("batch already started".to_string()))?;

        let (work_tx, work_rx) = mpsc::channel::<Plan>(self.backlog);
        let (results_tx, results_rx) = mpsc::channel::<BatchMessage>(self.backlog);
        let work_rx = Arc::new(Mutex::new(work_rx));

        debug!(
            concurrency = self.concurrency,
            backlog = self.backlog,
            "starting batch"
        );

        self.handles.push(tokio::spawn(feed(
            tasks,
            self.context.clone(),
            work_tx,
            results_tx.clone(),
            self.shutdown.clone(),
        )));

        for worker_id in 0..self.concurrency {
            self.handles.push(tokio::spawn(work(
                worker_id,
                Arc::clone(&work_rx),
                results_tx.clone(),
                self.shutdown.clone(),
            )));
        }

        Ok(BatchResults {
            rx: results_rx,
            shutdown: self.shutdown.clone(),
            iterated: 0,
            total: None,
            finished: false,
        })
    }

    /// Stop feeding and abandon queued plans; in-flight plans may finish
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("shutting down batch");
            self.shutdown.cancel();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called (or the parent token cancelled)
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut down and wait for the feeder and every worker to exit
    pub async fn close(mut self) {
        self.shutdown();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "batch worker exited abnormally");
            }
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("concurrency", &self.concurrency)
            .field("backlog", &self.backlog)
            .field("started", &self.tasks.is_none())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn feed(
    mut tasks: BoxStream<'static, Result<DownloadTask>>,
    context: SharedContext,
    work_tx: mpsc::Sender<Plan>,
    results_tx: mpsc::Sender<BatchMessage>,
    shutdown: CancellationToken,
) {
    let mut total = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(submitted = total, "feeder stopped by shutdown");
                return;
            }
            next = tasks.next() => next,
        };

        match next {
            Some(Ok(mut task)) => {
                task.set_context(context.clone());
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    sent = work_tx.send(Plan::new(task)) => sent,
                };
                if sent.is_err() {
                    return;
                }
                total += 1;
            }
            Some(Err(e)) => {
                error!(error = %e, submitted = total, "task stream failed");
                results_tx.send(BatchMessage::Fatal(e)).await.ok();
                return;
            }
            None => break,
        }
    }

    debug!(total, "feeder finished");
    results_tx.send(BatchMessage::End { total }).await.ok();
}

async fn work(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Plan>>>,
    results_tx: mpsc::Sender<BatchMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let plan = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                plan = queue.recv() => plan,
            }
        };
        let Some(mut plan) = plan else {
            break;
        };

        if shutdown.is_cancelled() {
            debug!(worker_id, url = %plan.task().url(), "skipping plan after shutdown");
            break;
        }

        plan.execute().await;
        if results_tx.send(BatchMessage::Item(plan)).await.is_err() {
            break;
        }
    }
}

/// Completion-ordered results of a [`Batch`] run
///
/// Single pass, not restartable. Per-task failures stay inside the yielded
/// plans; only a failure of the task stream itself is returned from
/// [`next`](Self::next).
#[derive(Debug)]
pub struct BatchResults {
    rx: mpsc::Receiver<BatchMessage>,
    shutdown: CancellationToken,
    iterated: usize,
    total: Option<usize>,
    finished: bool,
}

impl BatchResults {
    /// Wait for the next finished plan; `None` once every plan was yielded
    pub async fn next(&mut self) -> Result<Option<Plan>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.total.is_some_and(|total| self.iterated >= total) {
                self.finished = true;
                return Ok(None);
            }

            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                message = self.rx.recv() => message,
            };

            match message {
                Some(BatchMessage::Item(plan)) => {
                    self.iterated += 1;
                    return Ok(Some(plan));
                }
                Some(BatchMessage::Fatal(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                Some(BatchMessage::End { total }) => {
                    self.total = Some(total);
                }
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Number of plans yielded so far
    pub fn iterated(&self) -> usize {
        self.iterated
    }

    /// Total submitted, once the feeder finished
    pub fn total(&self) -> Option<usize> {
        self.total
    }
}

//! Scripted transport and delegate doubles for download, batch and change-set tests.

use super::{Delegate, DownloadTask, Reply, Transport};
use crate::error::{DownloadError, Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Chunk size the scripted transport splits bodies into
const CHUNK: usize = 3;

/// In-memory transport serving scripted bodies by URL
///
/// Unknown URLs fail with `NotFound`. URLs registered with [`fail`](Self::fail)
/// first write one chunk and then fail with a retryable error, the given number
/// of times.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    bodies: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `url`
    pub(crate) fn body(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    /// Fail the next `times` attempts on `url` with a transient error
    pub(crate) fn fail(self, url: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    /// Hold each attempt for `delay` before writing
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total attempts
    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Attempts made against `url`
    pub(crate) fn calls_for(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    /// Highest number of attempts observed running at once
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_failure(&self, url: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(url) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }

    async fn serve(&self, task: &mut DownloadTask, url: &str) -> Result<Reply> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let body = self.bodies.get(url);
        if self.take_failure(url) {
            if let Some(first) = body.and_then(|b| b.chunks(CHUNK).next()) {
                task.handle_write(first).await?;
            }
            return Err(DownloadError::failed(url, "scripted failure").into());
        }

        let Some(body) = body else {
            return Err(DownloadError::NotFound {
                url: url.to_string(),
            }
            .into());
        };
        for chunk in body.chunks(CHUNK) {
            task.handle_write(chunk).await?;
        }
        Ok(Reply {
            status: Some(200),
            content_length: Some(body.len() as u64),
            bytes: body.len() as u64,
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, task: &mut DownloadTask) -> Result<Reply> {
        let url = task.url().to_string();
        self.calls.lock().unwrap().push(url.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.serve(task, &url).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Delegate counting hook invocations; optionally repairs every error
#[derive(Default)]
pub(crate) struct CountingDelegate {
    pub(crate) always_repair: bool,
    pub(crate) mirror: Option<String>,
    pub(crate) prepared: AtomicUsize,
    pub(crate) replies: AtomicUsize,
    pub(crate) errors: AtomicUsize,
    pub(crate) succeeded: AtomicUsize,
    pub(crate) failed: AtomicUsize,
}

impl CountingDelegate {
    pub(crate) fn repairing() -> Self {
        Self {
            always_repair: true,
            ..Self::default()
        }
    }

    /// Repairs by switching the task to `url`
    pub(crate) fn rotating_to(url: &str) -> Self {
        Self {
            mirror: Some(url.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delegate for CountingDelegate {
    async fn on_prepare(&self, _task: &mut DownloadTask) -> Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_reply(&self, _task: &mut DownloadTask) -> Result<()> {
        self.replies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(&self, task: &mut DownloadTask, error: &Error) -> super::Repair {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if let Some(mirror) = &self.mirror {
            task.set_url(mirror.clone());
            return super::Repair::Retry;
        }
        if self.always_repair {
            super::Repair::Retry
        } else {
            super::Repair::for_error(error)
        }
    }

    async fn on_succeeded(&self, _task: &mut DownloadTask) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failed(&self, _task: &mut DownloadTask, _error: &Error) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

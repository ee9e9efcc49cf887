//! A single retryable download

use super::context::SharedContext;
use super::transport::{NopTransport, Reply, Transport};
use super::writer::{BufferWriter, Writer};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::{Backoff, IsRetryable};
use crate::validation::Validator;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of a [`DownloadTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet executed
    Created,
    /// Running the prepare hook
    Preparing,
    /// A transport attempt is in progress
    Sending,
    /// An attempt failed; the error hook decides whether to retry
    Repairing,
    /// Every byte was received; validators are being applied
    Validating,
    /// Terminal: validated and closed
    Succeeded,
    /// Terminal: retries exhausted, repair declined, or validation failed
    Failed,
}

/// Answer of the error hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// The task was repaired (or the error is transient); attempt again
    Retry,
    /// Give up and fail the task
    Declined,
}

impl Repair {
    /// Default policy: retry only transient errors
    pub fn for_error(error: &Error) -> Self {
        if error.is_retryable() {
            Repair::Retry
        } else {
            Repair::Declined
        }
    }
}

/// Credentials a transport may use for the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: Option<String>,
}

/// Policy hooks for a [`DownloadTask`]
///
/// Every method has a default, so a delegate overrides only what it needs.
/// The write hook must eventually call [`DownloadTask::write_through`] for the
/// chunk to reach the writer and the validators.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Runs once before the first attempt
    async fn on_prepare(&self, _task: &mut DownloadTask) -> Result<()> {
        Ok(())
    }

    /// Runs after each successful transport attempt
    async fn on_reply(&self, _task: &mut DownloadTask) -> Result<()> {
        Ok(())
    }

    /// Runs once per received chunk
    async fn on_write(&self, task: &mut DownloadTask, chunk: &[u8]) -> Result<()> {
        task.write_through(chunk).await
    }

    /// Runs after a failed attempt while retries remain
    ///
    /// May mutate the task (rotate a mirror with [`DownloadTask::set_url`],
    /// refresh credentials) before answering.
    async fn on_error(&self, _task: &mut DownloadTask, error: &Error) -> Repair {
        Repair::for_error(error)
    }

    /// Runs once when the task succeeded
    async fn on_succeeded(&self, _task: &mut DownloadTask) {}

    /// Runs once when the task failed
    async fn on_failed(&self, _task: &mut DownloadTask, _error: &Error) {}
}

/// One unit of download work
///
/// Executed once via [`execute`](Self::execute), which runs the prepare hook,
/// one or more transport attempts (bounded by `1 + retries`), the validators and
/// finally exactly one of the succeeded or failed hooks.
pub struct DownloadTask {
    url: String,
    writer: Box<dyn Writer>,
    validators: Vec<Box<dyn Validator>>,
    context: SharedContext,
    retries: u32,
    retry: RetryConfig,
    delegate: Option<Arc<dyn Delegate>>,
    attachment: Option<Box<dyn Any + Send + Sync>>,
    transport: Arc<dyn Transport>,
    credentials: Option<Credentials>,
    reply: Option<Reply>,
    state: TaskState,
    attempts: u32,
    bytes: u64,
}

impl DownloadTask {
    /// Download `url` into `writer` using `transport`
    pub fn new(
        url: impl Into<String>,
        writer: Box<dyn Writer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let retry = RetryConfig::default();
        Self {
            url: url.into(),
            writer,
            validators: Vec::new(),
            context: SharedContext::new(),
            retries: retry.max_attempts,
            retry,
            delegate: None,
            attachment: None,
            transport,
            credentials: None,
            reply: None,
            state: TaskState::Created,
            attempts: 0,
            bytes: 0,
        }
    }

    /// A task that transfers nothing and always succeeds
    pub fn placeholder() -> Self {
        Self::new(String::new(), Box::new(BufferWriter::new()), Arc::new(NopTransport))
    }

    /// Append a validator; validators run in the order they were added
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Append several validators
    pub fn with_validators(mut self, validators: Vec<Box<dyn Validator>>) -> Self {
        self.validators.extend(validators);
        self
    }

    /// Set retry count and backoff from `config`
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retries = config.max_attempts;
        self.retry = config;
        self
    }

    /// Override the number of retries
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Attach a delegate
    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Attach caller data, retrievable with [`attachment`](Self::attachment)
    pub fn with_attachment<T: Any + Send + Sync>(mut self, attachment: T) -> Self {
        self.attachment = Some(Box::new(attachment));
        self
    }

    /// Use credentials for the request
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Share `context` with the other tasks of a run
    pub fn with_context(mut self, context: SharedContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn set_context(&mut self, context: SharedContext) {
        self.context = context;
    }

    /// URL being downloaded (empty for placeholders)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Point the next attempt at another URL (mirror rotation)
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    /// The run's shared context
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Remaining retries
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Credentials for the request, if any
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Replace the credentials (token refresh)
    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Caller data of type `T`, if attached
    pub fn attachment<T: Any>(&self) -> Option<&T> {
        self.attachment.as_ref()?.downcast_ref::<T>()
    }

    /// Reply of the last successful attempt
    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of transport attempts made
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Bytes received by the current attempt
    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// The sink
    pub fn writer(&self) -> &dyn Writer {
        self.writer.as_ref()
    }

    /// Whether the task transfers nothing
    pub fn is_placeholder(&self) -> bool {
        self.url.is_empty()
    }

    /// Write hook entry point; transports call this once per chunk
    pub async fn handle_write(&mut self, chunk: &[u8]) -> Result<()> {
        match self.delegate.clone() {
            Some(delegate) => delegate.on_write(self, chunk).await,
            None => self.write_through(chunk).await,
        }
    }

    /// Forward a chunk to the writer and feed every validator
    pub async fn write_through(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write(chunk).await?;
        for validator in &mut self.validators {
            validator.update(chunk);
        }
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Run the task to completion
    ///
    /// Transport failures are retried while retries remain and the error hook
    /// grants a repair; validation failures are never retried. The original
    /// error is returned once the task failed.
    pub async fn execute(&mut self) -> Result<()> {
        let delegate = self.delegate.clone();

        self.state = TaskState::Preparing;
        if let Some(d) = &delegate {
            if let Err(e) = d.on_prepare(self).await {
                return self.fail(e).await;
            }
        }

        let mut backoff = Backoff::new(&self.retry);
        loop {
            self.state = TaskState::Sending;
            let error = match self.attempt().await {
                Ok(()) => break,
                Err(e) => e,
            };

            if self.retries == 0 {
                return self.fail(error).await;
            }

            self.state = TaskState::Repairing;
            let repair = match &delegate {
                Some(d) => d.on_error(self, &error).await,
                None => Repair::for_error(&error),
            };
            if repair == Repair::Declined {
                return self.fail(error).await;
            }

            self.retries -= 1;
            debug!(
                url = %self.url,
                attempt = self.attempts,
                remaining = self.retries,
                error = %error,
                "retrying download"
            );
            backoff.wait().await;
        }

        self.state = TaskState::Validating;
        let validation = self
            .validators
            .iter_mut()
            .try_for_each(|validator| validator.apply());
        if let Err(e) = validation {
            return self.fail(e.into()).await;
        }

        if let Err(e) = self.writer.close().await {
            return self.fail(e).await;
        }

        self.state = TaskState::Succeeded;
        if let Some(d) = &delegate {
            d.on_succeeded(self).await;
        }
        Ok(())
    }

    async fn attempt(&mut self) -> Result<()> {
        self.attempts += 1;
        self.bytes = 0;
        self.reply = None;
        self.writer.reset().await?;
        for validator in &mut self.validators {
            validator.reset();
        }

        let transport = Arc::clone(&self.transport);
        let reply = transport.send(self).await?;
        self.reply = Some(reply);

        if let Some(d) = self.delegate.clone() {
            d.on_reply(self).await?;
        }
        Ok(())
    }

    async fn fail(&mut self, error: Error) -> Result<()> {
        self.state = TaskState::Failed;
        if !self.is_placeholder() {
            warn!(url = %self.url, attempts = self.attempts, error = %error, "download failed");
        }
        if let Err(e) = self.writer.reset().await {
            warn!(url = %self.url, error = %e, "failed to discard partial download");
        }
        if let Some(d) = self.delegate.clone() {
            d.on_failed(self, &error).await;
        }
        Err(error)
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.url)
            .field("validators", &self.validators.len())
            .field("retries", &self.retries)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

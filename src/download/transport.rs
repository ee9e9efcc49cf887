//! Protocol transports
//!
//! A [`Transport`] performs one attempt of a [`DownloadTask`]: it fetches the
//! task's URL and hands every received chunk to
//! [`DownloadTask::handle_write`], which forwards it to the writer and the
//! validators. "Not found" and "not authorized" are reported as distinct
//! [`DownloadError`] variants so the retry policy can tell them apart from
//! transient failures.

use super::context::SharedContext;
use super::task::DownloadTask;
use crate::config::TransportConfig;
use crate::error::{DownloadError, Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Key under which the run's HTTP client is shared
const HTTP_CLIENT_KEY: &str = "http.client";

/// Read size for local files
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of one successful transport attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Protocol status code, when the protocol has one
    pub status: Option<u16>,
    /// Length announced by the remote before the body was read
    pub content_length: Option<u64>,
    /// Bytes actually handed to the writer
    pub bytes: u64,
}

/// Performs one download attempt for a task
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `task.url()`, calling `task.handle_write` once per chunk
    async fn send(&self, task: &mut DownloadTask) -> Result<Reply>;
}

/// Transport that transfers nothing; used for placeholder tasks
#[derive(Debug, Clone, Copy, Default)]
pub struct NopTransport;

#[async_trait]
impl Transport for NopTransport {
    async fn send(&self, _task: &mut DownloadTask) -> Result<Reply> {
        Ok(Reply::default())
    }
}

/// HTTP/HTTPS transport backed by `reqwest`
///
/// One client per batch run is created lazily and shared through the task's
/// [`SharedContext`](super::SharedContext), so concurrent downloads reuse its
/// connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    config: TransportConfig,
}

impl HttpTransport {
    /// Create a transport with the given settings
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Build the client; reads the CA certificate without holding any lock
    async fn build_client(config: &TransportConfig) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(!config.verify_tls);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(path) = &config.ca_certificate {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                Error::config(
                    "transport.ca_certificate",
                    format!("failed to read {}: {}", path.display(), e),
                )
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::config(
                    "transport.ca_certificate",
                    format!("invalid certificate {}: {}", path.display(), e),
                )
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        builder
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))
    }

    /// The run's shared client, built on first use
    async fn client(&self, context: &SharedContext) -> Result<Arc<reqwest::Client>> {
        if let Some(client) = context.get::<reqwest::Client>(HTTP_CLIENT_KEY) {
            return Ok(client);
        }
        let client = Self::build_client(&self.config).await?;
        context.get_or_insert(HTTP_CLIENT_KEY, client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, task: &mut DownloadTask) -> Result<Reply> {
        let url = task.url().to_string();
        let context = task.context().clone();
        let client = self.client(&context).await?;

        let mut request = client.get(&url);
        let credentials = task
            .credentials()
            .map(|c| (c.username.clone(), c.password.clone()))
            .or_else(|| {
                self.config
                    .username
                    .clone()
                    .map(|user| (user, self.config.password.clone()))
            });
        if let Some((username, password)) = credentials {
            request = request.basic_auth(username, password);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| DownloadError::failed(&url, e))?;

        let status = response.status();
        match status.as_u16() {
            404 => return Err(DownloadError::NotFound { url }.into()),
            401 | 403 => return Err(DownloadError::NotAuthorized { url }.into()),
            _ if !status.is_success() => {
                return Err(DownloadError::failed(&url, format!("HTTP {}", status)).into());
            }
            _ => {}
        }

        let mut reply = Reply {
            status: Some(status.as_u16()),
            content_length: response.content_length(),
            bytes: 0,
        };

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DownloadError::failed(&url, e))?
        {
            task.handle_write(&chunk).await?;
            reply.bytes += chunk.len() as u64;
        }

        tracing::debug!(url = %url, status = status.as_u16(), bytes = reply.bytes, "HTTP download finished");
        Ok(reply)
    }
}

/// Transport for `file://` URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, task: &mut DownloadTask) -> Result<Reply> {
        let url = task.url().to_string();
        let path = url::Url::parse(&url)
            .map_err(|e| DownloadError::unsupported(&url, e))?
            .to_file_path()
            .map_err(|_| DownloadError::unsupported(&url, "not a local file path"))?;

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DownloadError::NotFound { url: url.clone() },
            std::io::ErrorKind::PermissionDenied => {
                DownloadError::NotAuthorized { url: url.clone() }
            }
            _ => DownloadError::failed(&url, e),
        })?;
        let content_length = file.metadata().await.ok().map(|m| m.len());

        let mut reply = Reply {
            status: None,
            content_length,
            bytes: 0,
        };
        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::failed(&url, e))?;
            if n == 0 {
                break;
            }
            task.handle_write(&buffer[..n]).await?;
            reply.bytes += n as u64;
        }

        Ok(reply)
    }
}

/// Routes each task to a transport by URL scheme
///
/// Tasks with an empty URL (placeholders) go to [`NopTransport`].
#[derive(Clone, Default)]
pub struct SchemeTransport {
    routes: HashMap<String, Arc<dyn Transport>>,
}

impl SchemeTransport {
    /// Create a router with no schemes
    pub fn new() -> Self {
        Self::default()
    }

    /// `http`, `https` and `file` routes with the given HTTP settings
    pub fn with_defaults(config: TransportConfig) -> Self {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(config));
        Self::new()
            .route("http", Arc::clone(&http))
            .route("https", http)
            .route("file", Arc::new(FileTransport))
    }

    /// Register `transport` for `scheme`, replacing any previous route
    pub fn route(mut self, scheme: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.routes
            .insert(scheme.into().to_ascii_lowercase(), transport);
        self
    }

    fn resolve(&self, url: &str) -> Result<Arc<dyn Transport>> {
        let scheme = url::Url::parse(url)
            .map_err(|e| DownloadError::unsupported(url, e))?
            .scheme()
            .to_string();
        self.routes.get(&scheme).cloned().ok_or_else(|| {
            DownloadError::unsupported(url, format!("unsupported scheme '{}'", scheme)).into()
        })
    }
}

impl std::fmt::Debug for SchemeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<&String> = self.routes.keys().collect();
        schemes.sort();
        f.debug_struct("SchemeTransport")
            .field("schemes", &schemes)
            .finish()
    }
}

#[async_trait]
impl Transport for SchemeTransport {
    async fn send(&self, task: &mut DownloadTask) -> Result<Reply> {
        if task.url().is_empty() {
            return NopTransport.send(task).await;
        }
        let transport = self.resolve(task.url())?;
        transport.send(task).await
    }
}

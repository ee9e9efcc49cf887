//! Download execution: tasks, transports, writers and the batch engine.
//!
//! Split into focused submodules:
//! - `task` - [`DownloadTask`] lifecycle, [`Delegate`] hooks, retry and repair
//! - `transport` - [`Transport`] trait with HTTP, `file://` and no-op implementations
//! - `writer` - [`Writer`] sinks (file with full identity hashing, memory buffer)
//! - `context` - [`SharedContext`] property bag shared by one run
//! - `batch` - [`Batch`] engine and its completion-ordered [`BatchResults`]

mod batch;
mod context;
mod task;
mod transport;
mod writer;

pub use batch::{Batch, BatchMessage, BatchResults, DEFAULT_BACKLOG, DEFAULT_CONCURRENCY, Plan};
pub use context::SharedContext;
pub use task::{Credentials, Delegate, DownloadTask, Repair, TaskState};
pub use transport::{FileTransport, HttpTransport, NopTransport, Reply, SchemeTransport, Transport};
pub use writer::{BufferWriter, FileWriter, Writer, WrittenFile};

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

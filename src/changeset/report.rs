//! Per-item outcomes of a change set

use crate::error::Error;
use crate::types::{ChangeAction, ContentId, NaturalKey};
use thiserror::Error;

/// A failure while adding or removing one content item
///
/// Always captured into that item's [`ChangeReport`]; never returned from the run.
#[derive(Debug, Error)]
#[error("failed to {action} {key}: {source}")]
pub struct ChangeFailed {
    /// What was being done
    pub action: ChangeAction,
    /// Natural key of the item
    pub key: NaturalKey,
    /// Underlying error
    #[source]
    pub source: Box<Error>,
}

impl ChangeFailed {
    /// Wrap `error` for the item `key`
    pub fn new(action: ChangeAction, key: NaturalKey, error: Error) -> Self {
        Self {
            action,
            key,
            source: Box::new(error),
        }
    }
}

/// Outcome of one addition or removal
#[derive(Debug)]
pub struct ChangeReport {
    /// Whether the item was being added or removed
    pub action: ChangeAction,
    /// Natural key of the item
    pub key: NaturalKey,
    /// Stored content id, when known
    pub content: Option<ContentId>,
    /// Set when the change failed
    pub error: Option<ChangeFailed>,
}

impl ChangeReport {
    pub(crate) fn succeeded(action: ChangeAction, key: NaturalKey, content: Option<ContentId>) -> Self {
        Self {
            action,
            key,
            content,
            error: None,
        }
    }

    pub(crate) fn failed(action: ChangeAction, key: NaturalKey, content: Option<ContentId>, error: Error) -> Self {
        Self {
            action,
            error: Some(ChangeFailed::new(action, key.clone(), error)),
            key,
            content,
        }
    }

    /// Whether the change was applied
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

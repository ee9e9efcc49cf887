//! Core types for content-sync

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SyncMode;

/// Declares an i64-backed database id with the conversions and sqlx impls the
/// persistence layer binds against.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

id_type!(
    /// Storage-assigned identifier of a content row
    ContentId
);
id_type!(
    /// Storage-assigned identifier of an artifact row
    ArtifactId
);
id_type!(
    /// Storage-assigned identifier of a repository
    RepositoryId
);
id_type!(
    /// Storage-assigned identifier of a repository version
    VersionId
);

/// Stable, caller-meaningful identity of a content item
///
/// A natural key is the content type plus an ordered map of identity fields
/// (for a package: name, version, release, arch). It is independent of any
/// storage-assigned id and is what deduplication and mirror diffs compare.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    content_type: String,
    fields: BTreeMap<String, String>,
}

impl NaturalKey {
    /// Build a key from the content type and its identity fields
    pub fn new<K, V>(content_type: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            content_type: content_type.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The content type this key belongs to
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Identity fields, ordered by name
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Canonical string encoding stored in the `content.natural_key` column
    ///
    /// Fields are sorted by name so equal keys always encode identically.
    pub fn encode(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Rebuild a key from its content type and [`encode`](Self::encode)d fields
    pub fn decode(content_type: impl Into<String>, encoded: &str) -> Self {
        let fields = encoded
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (unescape(k), unescape(v)),
                None => (unescape(pair), String::new()),
            })
            .collect();
        Self {
            content_type: content_type.into(),
            fields,
        }
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.content_type, self.encode())
    }
}

fn escape(s: &str) -> String {
    s.replace('%', "%25").replace('&', "%26").replace('=', "%3D")
}

fn unescape(s: &str) -> String {
    s.replace("%3D", "=").replace("%26", "&").replace("%25", "%")
}

/// Kind of change applied to a repository version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Content was added to the version
    Added,
    /// Content was removed from the version
    Removed,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Added => write!(f, "add"),
            ChangeAction::Removed => write!(f, "remove"),
        }
    }
}

/// Aggregate outcome of applying a change set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Content items successfully added
    pub added: u64,
    /// Content items successfully removed
    pub removed: u64,
    /// Content items whose add or removal failed
    pub failed: u64,
}

impl SyncSummary {
    /// Total number of processed items
    pub fn total(&self) -> u64 {
        self.added + self.removed + self.failed
    }
}

/// Event emitted during a sync run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new repository version is being built
    SyncStarted {
        /// Repository being synchronized
        repository: RepositoryId,
        /// The version under construction
        version: VersionId,
        /// Reconciliation strategy
        mode: SyncMode,
    },

    /// An artifact download finished and passed validation
    ArtifactDownloaded {
        /// Source URL
        url: String,
        /// Number of bytes received
        size: u64,
    },

    /// Content was committed and associated with the version
    ContentAdded {
        /// Stored content id
        content: ContentId,
        /// Natural key of the content
        key: String,
    },

    /// Content was removed from the version
    ContentRemoved {
        /// Stored content id
        content: ContentId,
        /// Natural key of the content
        key: String,
    },

    /// Adding or removing one content item failed
    ChangeFailed {
        /// The attempted action
        action: ChangeAction,
        /// Natural key of the content
        key: String,
        /// Error message
        error: String,
    },

    /// The version was completed
    SyncComplete {
        /// Repository that was synchronized
        repository: RepositoryId,
        /// The completed version
        version: VersionId,
        /// Aggregate counts
        summary: SyncSummary,
    },

    /// The run aborted; the version under construction was discarded
    SyncFailed {
        /// Repository that was being synchronized
        repository: RepositoryId,
        /// Error message
        error: String,
    },
}

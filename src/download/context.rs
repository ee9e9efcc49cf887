//! Property bag shared by every download of one batch run.

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Value = Arc<dyn Any + Send + Sync>;

/// Mutex-guarded key/value bag scoped to one [`Batch`](super::Batch) run
///
/// Sibling downloads use it to lazily agree on one expensive resource (an HTTP
/// client, a session token) the first time any of them needs it. The lock is
/// held only for the map access and never across an `.await`.
#[derive(Clone, Default)]
pub struct SharedContext {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // A panicking factory leaves the map itself intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the value stored under `key`, if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().insert(key.into(), Arc::new(value));
    }

    /// Remove the value stored under `key`
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Get the value under `key`, creating it with `factory` if absent
    ///
    /// The check and the insert happen under one lock, so concurrent callers
    /// observe exactly one created value.
    pub fn get_or_create<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.get_or_try_create(key, || Ok(factory()))
    }

    /// Fallible variant of [`get_or_create`](Self::get_or_create)
    ///
    /// Nothing is stored when `factory` fails.
    pub fn get_or_try_create<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        let mut map = self.lock();
        let value = match map.get(key) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created: Value = Arc::new(factory()?);
                map.insert(key.to_string(), Arc::clone(&created));
                created
            }
        };
        drop(map);

        value.downcast::<T>().map_err(|_| {
            Error::Other(format!(
                "shared context key '{}' holds a value of another type",
                key
            ))
        })
    }

    /// Store `value` under `key` unless a value is already there
    ///
    /// Returns whichever value ends up stored, so a caller that built `value`
    /// outside the lock and lost the race adopts the winner's.
    pub fn get_or_insert<T: Any + Send + Sync>(&self, key: &str, value: T) -> Result<Arc<T>> {
        self.get_or_create(key, || value)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the context holds no values
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        f.debug_struct("SharedContext").field("keys", &keys).finish()
    }
}

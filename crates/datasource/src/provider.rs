//! Backing-source providers and their registry

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tessera_core::{CacheError, Result, Value};
use thiserror::Error;

use crate::operation::WriteOperation;

/// Failure reported by a provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying with the same operation
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

/// An external data source the cache writes through/behind to
pub trait DataSourceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    fn write(&self, operation: &WriteOperation) -> std::result::Result<(), ProviderError>;

    /// One result per operation, in order
    fn write_bulk(
        &self,
        operations: &[WriteOperation],
    ) -> Vec<std::result::Result<(), ProviderError>> {
        operations.iter().map(|op| self.write(op)).collect()
    }

    /// Read-through load; `Ok(None)` when the source has no such key
    fn load(&self, _key: &str) -> std::result::Result<Option<Value>, ProviderError> {
        Ok(None)
    }
}

/// Named providers plus a default
///
/// The first provider registered becomes the default.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<FxHashMap<String, Arc<dyn DataSourceProvider>>>,
    default: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn DataSourceProvider>) {
        let name = provider.name().to_string();
        self.providers.write().insert(name.clone(), provider);
        let mut default = self.default.write();
        if default.is_none() {
            *default = Some(name);
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn DataSourceProvider>> {
        let removed = self.providers.write().remove(name);
        let mut default = self.default.write();
        if default.as_deref() == Some(name) {
            *default = None;
        }
        removed
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        if !self.providers.read().contains_key(name) {
            return Err(CacheError::invalid_argument(format!(
                "unknown data source provider '{}'",
                name
            )));
        }
        *self.default.write() = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.default.read().clone()
    }

    /// Provider by name, or the default when `name` is `None`
    pub fn get(&self, name: Option<&str>) -> Option<Arc<dyn DataSourceProvider>> {
        let providers = self.providers.read();
        match name {
            Some(name) => providers.get(name).cloned(),
            None => {
                let default = self.default.read();
                default.as_deref().and_then(|n| providers.get(n).cloned())
            }
        }
    }

    /// Like [`get`](Self::get), failing with `BackingSourceUnavailable` when the
    /// provider is missing or disabled.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn DataSourceProvider>> {
        match self.get(name) {
            Some(p) if p.is_enabled() => Ok(p),
            Some(p) => Err(CacheError::backing_source_unavailable(format!(
                "provider '{}' is disabled",
                p.name()
            ))),
            None => Err(CacheError::backing_source_unavailable(match name {
                Some(n) => format!("provider '{}' is not configured", n),
                None => "no default provider is configured".to_string(),
            })),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .field("default", &self.default_name())
            .finish()
    }
}

//! Per-call context threaded from the facade down to collaborators

use crate::error::{CacheError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and a bulk operation
///
/// Cloning shares the flag. Cancellation is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(OperationCanceled)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CacheError::OperationCanceled)
        } else {
            Ok(())
        }
    }
}

/// Ambient data for a single facade call
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Client on whose behalf the operation runs; used to route write-behind
    /// completions back to it.
    pub client_id: Option<String>,
    /// Internal/system operations skip the graceful-shutdown wait.
    pub no_graceful_block: bool,
    /// Checked at bulk-operation chunk boundaries.
    pub cancel: Option<CancellationToken>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    /// Context for internal operations that must never block on shutdown
    pub fn internal() -> Self {
        Self {
            no_graceful_block: true,
            ..Default::default()
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.check().is_ok());

        token.cancel();
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(CacheError::OperationCanceled)));
    }

    #[test]
    fn test_context_without_token_is_never_cancelled() {
        assert!(OperationContext::new().check_cancelled().is_ok());
    }

    #[test]
    fn test_internal_context_skips_graceful_block() {
        assert!(OperationContext::internal().no_graceful_block);
        assert!(!OperationContext::for_client("c1").no_graceful_block);
    }
}

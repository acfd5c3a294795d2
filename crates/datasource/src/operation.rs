//! Write operations handed to a backing source and their results

use tessera_core::{CacheEntry, Timestamp, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperationKind {
    Add,
    Insert,
    Remove,
}

/// One mutation to push to a backing source
///
/// The entry is the snapshot taken when the local write committed. Retries
/// replay exactly this snapshot, never the entry's later state.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOperation {
    pub id: Uuid,
    pub key: String,
    pub entry: Option<CacheEntry>,
    pub kind: WriteOperationKind,
    /// Provider name; `None` selects the registry default
    pub provider: Option<String>,
    /// Client to notify when a write-behind completes
    pub client_id: Option<String>,
    /// Provider calls made so far
    pub attempts: u32,
    pub created_at: Timestamp,
}

impl WriteOperation {
    pub fn new(key: impl Into<String>, entry: Option<CacheEntry>, kind: WriteOperationKind) -> Self {
        WriteOperation {
            id: Uuid::new_v4(),
            key: key.into(),
            entry,
            kind,
            provider: None,
            client_id: None,
            attempts: 0,
            created_at: Timestamp::now(),
        }
    }

    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_client(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn value(&self) -> Option<&Value> {
        self.entry.as_ref().map(|e| &e.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Success,
    /// Transient failure; the operation can be replayed as-is
    FailureRetry,
    FailurePermanent,
}

/// Final or intermediate result of pushing a [`WriteOperation`]
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceOperationResult {
    pub status: OperationStatus,
    pub operation: WriteOperation,
    pub error: Option<String>,
}

impl DataSourceOperationResult {
    pub fn success(operation: WriteOperation) -> Self {
        DataSourceOperationResult {
            status: OperationStatus::Success,
            operation,
            error: None,
        }
    }

    pub fn retry(operation: WriteOperation, error: impl Into<String>) -> Self {
        DataSourceOperationResult {
            status: OperationStatus::FailureRetry,
            operation,
            error: Some(error.into()),
        }
    }

    pub fn permanent(operation: WriteOperation, error: impl Into<String>) -> Self {
        DataSourceOperationResult {
            status: OperationStatus::FailurePermanent,
            operation,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }

    pub fn key(&self) -> &str {
        &self.operation.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_has_unique_id() {
        let a = WriteOperation::new("k", None, WriteOperationKind::Remove);
        let b = WriteOperation::new("k", None, WriteOperationKind::Remove);
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempts, 0);
    }

    #[test]
    fn test_value_comes_from_snapshot() {
        let op = WriteOperation::new("k", Some(CacheEntry::new("v")), WriteOperationKind::Insert)
            .with_provider(Some("db".into()))
            .with_client(Some("c1".into()));
        assert_eq!(op.value(), Some(&Value::from("v")));
        assert_eq!(op.provider.as_deref(), Some("db"));
        assert_eq!(op.client_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_result_constructors() {
        let op = WriteOperation::new("k", None, WriteOperationKind::Add);
        assert!(DataSourceOperationResult::success(op.clone()).is_success());
        let retry = DataSourceOperationResult::retry(op.clone(), "timeout");
        assert_eq!(retry.status, OperationStatus::FailureRetry);
        assert_eq!(retry.error.as_deref(), Some("timeout"));
        assert_eq!(retry.key(), "k");
        let perm = DataSourceOperationResult::permanent(op, "constraint");
        assert_eq!(perm.status, OperationStatus::FailurePermanent);
    }
}

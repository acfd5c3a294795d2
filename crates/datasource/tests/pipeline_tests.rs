//! Integration tests for the data source sync pipeline
//!
//! Providers here are scripted: each one answers a fixed sequence of results
//! and records what actually landed.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{CacheEntry, CacheError, DataSourceMode, Value};
use tessera_datasource::{
    DataSourceManager, DataSourceOptions, DataSourceProvider, DataSourceSyncPipeline, NodeRole,
    OperationStatus, ProviderError, RetryPolicy, SyncResult, WriteOperation, WriteOperationKind,
};

const WAIT: Duration = Duration::from_secs(5);

struct ScriptedSink {
    name: String,
    script: Mutex<VecDeque<Result<(), ProviderError>>>,
    calls: AtomicUsize,
    landed: Mutex<Vec<(String, Option<Value>)>>,
}

impl ScriptedSink {
    fn new(name: &str, script: Vec<Result<(), ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            landed: Mutex::new(Vec::new()),
        })
    }

    fn landed_keys(&self) -> Vec<String> {
        self.landed.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

impl DataSourceProvider for ScriptedSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, operation: &WriteOperation) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.landed
                .lock()
                .push((operation.key.clone(), operation.value().cloned()));
        }
        next
    }
}

fn transient() -> Result<(), ProviderError> {
    Err(ProviderError::Transient("connection reset".into()))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_base_delay_ms(1).with_max_delay_ms(5)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn setup(sink: Arc<ScriptedSink>, retry: RetryPolicy) -> DataSourceSyncPipeline {
    init_tracing();
    let manager = DataSourceManager::new(DataSourceOptions {
        retry,
        ..Default::default()
    })
    .unwrap();
    manager.register_provider(sink);
    DataSourceSyncPipeline::new(Arc::new(manager), NodeRole::local())
}

fn insert_op(key: &str, value: &str) -> WriteOperation {
    WriteOperation::new(key, Some(CacheEntry::new(value)), WriteOperationKind::Insert)
}

// ============================================================================
// Write-through
// ============================================================================

mod write_through {
    use super::*;

    #[test]
    fn test_transient_failure_lands_exactly_once() {
        let sink = ScriptedSink::new("db", vec![transient(), Ok(())]);
        let pipeline = setup(sink.clone(), fast_retry());

        let result = pipeline
            .sync_after_write(insert_op("user:1", "alice"), DataSourceMode::WriteThrough)
            .unwrap()
            .unwrap();

        let ticket = match result {
            SyncResult::Requeued { result, ticket } => {
                assert_eq!(result.status, OperationStatus::FailureRetry);
                ticket
            }
            other => panic!("expected requeue, got {:?}", other),
        };
        let final_result = ticket.wait(WAIT).unwrap();
        assert!(final_result.is_success());
        assert_eq!(final_result.operation.attempts, 2);

        pipeline.manager().drain(WAIT);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *sink.landed.lock(),
            vec![("user:1".to_string(), Some(Value::from("alice")))]
        );
    }

    #[test]
    fn test_requeue_carries_original_snapshot() {
        let sink = ScriptedSink::new("db", vec![transient(), Ok(())]);
        let pipeline = setup(sink.clone(), fast_retry());

        let op = insert_op("k", "v1");
        let id = op.id;
        let result = pipeline
            .sync_after_write(op, DataSourceMode::WriteThrough)
            .unwrap()
            .unwrap();
        let done = result.ticket().unwrap().wait(WAIT).unwrap();
        assert_eq!(done.operation.id, id);
        assert_eq!(done.operation.value(), Some(&Value::from("v1")));
    }

    #[test]
    fn test_permanent_failure_is_not_requeued() {
        let sink = ScriptedSink::new("db", vec![Err(ProviderError::Permanent("bad row".into()))]);
        let pipeline = setup(sink.clone(), fast_retry());

        let result = pipeline
            .sync_after_write(insert_op("k", "v"), DataSourceMode::WriteThrough)
            .unwrap()
            .unwrap();
        assert_eq!(
            result.result().unwrap().status,
            OperationStatus::FailurePermanent
        );
        assert!(pipeline.manager().drain(WAIT));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.manager().queue_stats().completed, 0);
    }

    #[test]
    fn test_exhausted_retries_are_reported_on_ticket() {
        let sink = ScriptedSink::new("db", vec![transient(); 10]);
        let pipeline = setup(sink.clone(), fast_retry().with_max_retries(2));

        let result = pipeline
            .sync_after_write(insert_op("k", "v"), DataSourceMode::WriteThrough)
            .unwrap()
            .unwrap();
        let done = result.ticket().unwrap().wait(WAIT).unwrap();
        assert_eq!(done.status, OperationStatus::FailureRetry);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert!(sink.landed.lock().is_empty());
    }
}

// ============================================================================
// Write-behind
// ============================================================================

mod write_behind {
    use super::*;

    #[test]
    fn test_enqueue_returns_before_provider_runs() {
        let sink = ScriptedSink::new("db", vec![]);
        let pipeline = setup(sink.clone(), fast_retry());

        let result = pipeline
            .sync_after_write(insert_op("k", "v"), DataSourceMode::WriteBehind)
            .unwrap()
            .unwrap();
        assert!(matches!(result, SyncResult::Queued(_)));
        assert!(result.ticket().unwrap().wait(WAIT).unwrap().is_success());
        assert_eq!(sink.landed_keys(), vec!["k"]);
    }

    #[test]
    fn test_completion_hook_sees_client_id() {
        let sink = ScriptedSink::new("db", vec![]);
        let pipeline = setup(sink, fast_retry());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = Arc::clone(&seen);
        pipeline.manager().set_completion_hook(Arc::new(move |r| {
            seen_hook.lock().push(r.operation.client_id.clone());
        }));

        let op = insert_op("k", "v").with_client(Some("client-7".into()));
        let result = pipeline
            .sync_after_write(op, DataSourceMode::WriteBehind)
            .unwrap()
            .unwrap();
        result.ticket().unwrap().wait(WAIT).unwrap();
        assert!(pipeline.manager().drain(WAIT));
        assert_eq!(*seen.lock(), vec![Some("client-7".to_string())]);
    }

    #[test]
    fn test_bulk_forwards_only_committed_keys() {
        let sink = ScriptedSink::new("db", vec![]);
        let pipeline = setup(sink.clone(), fast_retry());
        let failed: FxHashSet<String> = ["k2".to_string(), "k4".to_string()].into_iter().collect();
        let ops = (1..=5).map(|i| insert_op(&format!("k{}", i), "v")).collect();

        let results = pipeline
            .sync_after_bulk_write(ops, &failed, DataSourceMode::WriteBehind)
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(pipeline.manager().drain(WAIT));

        let mut keys = sink.landed_keys();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k3", "k5"]);
    }
}

// ============================================================================
// Availability
// ============================================================================

mod availability {
    use super::*;

    #[test]
    fn test_disabled_provider_fails_fast() {
        struct Disabled;
        impl DataSourceProvider for Disabled {
            fn name(&self) -> &str {
                "off"
            }
            fn is_enabled(&self) -> bool {
                false
            }
            fn write(&self, _: &WriteOperation) -> Result<(), ProviderError> {
                panic!("disabled provider must not be called");
            }
        }

        let manager = DataSourceManager::new(DataSourceOptions::default()).unwrap();
        manager.register_provider(Arc::new(Disabled));
        let pipeline = DataSourceSyncPipeline::new(Arc::new(manager), NodeRole::local());

        for mode in [DataSourceMode::WriteThrough, DataSourceMode::WriteBehind] {
            assert!(matches!(
                pipeline.ensure_available(mode, None),
                Err(CacheError::BackingSourceUnavailable { .. })
            ));
        }
        assert!(pipeline.ensure_available(DataSourceMode::None, None).is_ok());
    }

    #[test]
    fn test_unknown_provider_name_fails_fast() {
        let pipeline = setup(ScriptedSink::new("db", vec![]), fast_retry());
        assert!(pipeline
            .ensure_available(DataSourceMode::WriteThrough, Some("db"))
            .is_ok());
        assert!(pipeline
            .ensure_available(DataSourceMode::WriteThrough, Some("warehouse"))
            .is_err());
    }
}

use super::{EntryStore, StoreInner};
use crate::cascade::CascadeDependencyResolver;
use crate::config::CacheConfig;
use crate::events::{CacheEvent, EventRegistry};
use crate::features::{Feature, FeatureGate};
use crate::shutdown::ShutdownCoordinator;
use crate::stats::CacheStats;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessera_cluster::{
    ClientDeath, ConnectedClientsLedger, DeathCallback, NotificationKind, NotificationSpec,
    TaskScheduler, TimeScheduler,
};
use tessera_concurrency::LockIdGenerator;
use tessera_core::{CacheImpl, Result, StatsCollector};
use tessera_datasource::{
    CompletionHook, DataSourceManager, DataSourceOperationResult, DataSourceProvider,
    DataSourceSyncPipeline, WriteBehindForwarder,
};
use tessera_storage::LocalStore;
use tracing::{debug, info};

/// Assembles an [`EntryStore`] from its collaborators
///
/// Anything not supplied gets the in-process default: a [`LocalStore`], a
/// [`TimeScheduler`] thread and the global [`CacheStats`].
///
/// ```ignore
/// let store = EntryStore::builder(CacheConfig::default())
///     .provider(Arc::new(MyDatabase::connect()?))
///     .build()?;
/// store.start()?;
/// ```
pub struct EntryStoreBuilder {
    config: CacheConfig,
    storage: Option<Arc<dyn CacheImpl>>,
    providers: Vec<Arc<dyn DataSourceProvider>>,
    stats: Option<Arc<dyn StatsCollector>>,
    features: FeatureGate,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    forwarder: Option<Arc<dyn WriteBehindForwarder>>,
    death_callback: Option<DeathCallback>,
}

impl EntryStoreBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            storage: None,
            providers: Vec::new(),
            stats: None,
            features: FeatureGate::default(),
            scheduler: None,
            forwarder: None,
            death_callback: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn CacheImpl>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register a backing-source provider. The first one becomes the default.
    pub fn provider(mut self, provider: Arc<dyn DataSourceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn features(mut self, features: FeatureGate) -> Self {
        self.features = features;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Route write-behind through a coordinator node.
    pub fn forwarder(mut self, forwarder: Arc<dyn WriteBehindForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Called for both death detection and death notification of a client.
    pub fn on_client_death(
        mut self,
        callback: impl Fn(&ClientDeath) + Send + Sync + 'static,
    ) -> Self {
        self.death_callback = Some(Arc::new(callback));
        self
    }

    /// Build a stopped store; call [`EntryStore::start`] to serve.
    pub fn build(self) -> Result<EntryStore> {
        self.config.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(LocalStore::new().with_max_entries(self.config.storage.max_entries)),
        };
        let stats = match self.stats {
            Some(stats) => stats,
            None => CacheStats::global() as Arc<dyn StatsCollector>,
        };
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TimeScheduler::start()?),
        };

        let manager = Arc::new(DataSourceManager::new(self.config.datasource_options())?);
        for provider in self.providers {
            manager.register_provider(provider);
        }
        let mut pipeline = DataSourceSyncPipeline::new(Arc::clone(&manager), self.config.node_role());
        if let Some(forwarder) = self.forwarder {
            pipeline = pipeline.with_forwarder(forwarder);
        }

        let ledger = Arc::new(ConnectedClientsLedger::new(scheduler));
        if self.features.is_enabled(Feature::ClientDeathNotification) {
            register_death_notifications(&ledger, &self.config, self.death_callback);
        }

        let events = Arc::new(EventRegistry::new());
        manager.set_completion_hook(completion_hook(
            Arc::clone(&events),
            Arc::clone(&ledger),
            Arc::clone(&stats),
        ));

        info!(
            target: "tessera::store",
            name = %self.config.name,
            topology = ?self.config.topology,
            "Cache built"
        );
        Ok(EntryStore::from_inner(StoreInner {
            lock_ids: LockIdGenerator::new(),
            cascade: CascadeDependencyResolver::new(Arc::clone(&storage)),
            storage,
            pipeline,
            shutdown: ShutdownCoordinator::new(),
            ledger,
            events,
            stats,
            features: self.features,
            cleaner: Mutex::new(None),
            running: AtomicBool::new(false),
            config: self.config,
        }))
    }
}

fn register_death_notifications(
    ledger: &ConnectedClientsLedger,
    config: &CacheConfig,
    callback: Option<DeathCallback>,
) {
    let specs = [
        (NotificationKind::DeathDetection, config.death_detection_grace()),
        (NotificationKind::DeathNotification, config.death_notification_grace()),
    ];
    for (kind, grace) in specs {
        let callback = callback.clone();
        ledger.register_notification(NotificationSpec::new(kind, grace, move |death| {
            info!(
                target: "tessera::clients",
                client_id = %death.client_id,
                kind = ?death.kind,
                disconnected_at = %death.disconnected_at,
                "Client declared dead"
            );
            if let Some(callback) = &callback {
                callback(death);
            }
        }));
    }
}

/// Final results of queued writes. Client-bound completions are delivered only
/// while the client may still be listening.
fn completion_hook(
    events: Arc<EventRegistry>,
    ledger: Arc<ConnectedClientsLedger>,
    stats: Arc<dyn StatsCollector>,
) -> CompletionHook {
    Arc::new(move |result: &DataSourceOperationResult| {
        stats.record_ds_write(result.is_success());
        let Some(client_id) = result.operation.client_id.as_deref() else {
            return;
        };
        if ledger.is_client_connected_or_potentially_dead(client_id) {
            events.publish(&CacheEvent::WriteBehindCompleted {
                client_id: client_id.to_string(),
                result: result.clone(),
            });
        } else {
            debug!(target: "tessera::ds", client_id, key = %result.key(), "Dropping completion for departed client");
        }
    })
}

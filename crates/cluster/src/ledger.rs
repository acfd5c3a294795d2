//! Connected clients ledger
//!
//! Tracks which cluster nodes each client is reachable through. A client is
//! only considered gone once no node reports it, and even then the death
//! callbacks wait out a grace period during which a reconnect cancels them.
//!
//! All bookkeeping happens under one ledger lock; death callbacks run after
//! it is released.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::address::{ClientInfo, ConnectivityStatus, NodeAddress};
use crate::scheduler::{ScheduledTask, TaskScheduler};

/// Which death notification a task delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Internal cleanup of per-client state
    DeathDetection,
    /// Client death events for interested listeners
    DeathNotification,
}

/// Delivered when a client stays unreachable for a whole grace period
#[derive(Debug, Clone)]
pub struct ClientDeath {
    pub client_id: String,
    pub info: ClientInfo,
    pub kind: NotificationKind,
    pub disconnected_at: DateTime<Utc>,
}

pub type DeathCallback = Arc<dyn Fn(&ClientDeath) + Send + Sync>;

/// One death notification to schedule whenever a client becomes unreachable
#[derive(Clone)]
pub struct NotificationSpec {
    pub kind: NotificationKind,
    pub grace_period: Duration,
    pub callback: DeathCallback,
}

impl NotificationSpec {
    pub fn new(
        kind: NotificationKind,
        grace_period: Duration,
        callback: impl Fn(&ClientDeath) + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            grace_period,
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for NotificationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSpec")
            .field("kind", &self.kind)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

/// Result of `client_connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First node for a client nobody knew about
    NewClient,
    /// Came back within the grace period; pending death tasks were cancelled
    Reconnected,
    /// Known client, reachable through one more node
    AdditionalNode,
    /// Node was already recorded
    Duplicate,
}

impl ConnectOutcome {
    /// Whether listeners should hear about a new client connection
    pub fn is_new_connection(&self) -> bool {
        matches!(self, ConnectOutcome::NewClient)
    }
}

#[derive(Debug, Clone)]
struct ConnectedClient {
    info: ClientInfo,
    nodes: SmallVec<[NodeAddress; 2]>,
}

#[derive(Default)]
struct LedgerState {
    clients: FxHashMap<String, ConnectedClient>,
    pending: FxHashMap<String, Vec<Arc<DeadClientTask>>>,
}

impl LedgerState {
    fn has_pending(&self, client_id: &str) -> bool {
        self.pending
            .get(client_id)
            .is_some_and(|tasks| tasks.iter().any(|t| !t.is_cancelled()))
    }
}

struct LedgerShared {
    state: Mutex<LedgerState>,
}

/// Fires one death notification unless the client returns first
struct DeadClientTask {
    death: ClientDeath,
    grace_period: Duration,
    callback: DeathCallback,
    cancelled: AtomicBool,
    done: AtomicBool,
    ledger: Weak<LedgerShared>,
}

impl DeadClientTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl ScheduledTask for DeadClientTask {
    fn next_interval(&self) -> Option<Duration> {
        if self.done.load(Ordering::Acquire) {
            None
        } else {
            Some(self.grace_period)
        }
    }

    fn run(&self) {
        self.done.store(true, Ordering::Release);
        let Some(shared) = self.ledger.upgrade() else {
            return;
        };

        let fire = {
            let mut state = shared.state.lock();
            if self.is_cancelled() {
                false
            } else {
                let client_id = &self.death.client_id;
                if let Some(tasks) = state.pending.get_mut(client_id) {
                    tasks.retain(|t| !std::ptr::eq(Arc::as_ptr(t), self));
                    if tasks.is_empty() {
                        state.pending.remove(client_id);
                    }
                }
                !state.clients.contains_key(client_id)
            }
        };

        if fire {
            info!(
                target: "tessera::clients",
                client_id = %self.death.client_id,
                kind = ?self.death.kind,
                "Client declared dead"
            );
            (self.callback)(&self.death);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Per-client node sets plus deferred death detection
pub struct ConnectedClientsLedger {
    shared: Arc<LedgerShared>,
    specs: RwLock<Vec<NotificationSpec>>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl ConnectedClientsLedger {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            shared: Arc::new(LedgerShared {
                state: Mutex::new(LedgerState::default()),
            }),
            specs: RwLock::new(Vec::new()),
            scheduler,
        }
    }

    /// Schedule `spec` for every client that becomes unreachable from now on
    pub fn register_notification(&self, spec: NotificationSpec) {
        debug!(target: "tessera::clients", kind = ?spec.kind, grace = ?spec.grace_period, "Death notification registered");
        self.specs.write().push(spec);
    }

    pub fn client_connected(
        &self,
        client_id: &str,
        info: ClientInfo,
        node: NodeAddress,
    ) -> ConnectOutcome {
        let mut state = self.shared.state.lock();

        let cancelled = match state.pending.remove(client_id) {
            Some(tasks) => {
                let live = tasks.iter().filter(|t| !t.is_cancelled()).count();
                tasks.iter().for_each(|t| t.cancel());
                live > 0
            }
            None => false,
        };

        let outcome = match state.clients.get_mut(client_id) {
            Some(client) if client.nodes.contains(&node) => ConnectOutcome::Duplicate,
            Some(client) => {
                client.nodes.push(node.clone());
                ConnectOutcome::AdditionalNode
            }
            None => {
                let mut info = info;
                info.status = ConnectivityStatus::Connected;
                let mut nodes = SmallVec::new();
                nodes.push(node.clone());
                state
                    .clients
                    .insert(client_id.to_string(), ConnectedClient { info, nodes });
                if cancelled {
                    ConnectOutcome::Reconnected
                } else {
                    ConnectOutcome::NewClient
                }
            }
        };
        drop(state);

        debug!(target: "tessera::clients", client_id, %node, ?outcome, "Client connected");
        outcome
    }

    /// Remove `node` from the client's node set.
    ///
    /// Returns true when that was the client's last node; the client is then
    /// removed and its death notifications scheduled.
    pub fn client_disconnected(
        &self,
        client_id: &str,
        node: &NodeAddress,
        disconnected_at: DateTime<Utc>,
    ) -> bool {
        let tasks = {
            let mut state = self.shared.state.lock();
            match Self::detach(&mut state, client_id, node) {
                Some(info) => self.schedule_death(&mut state, client_id, info, disconnected_at),
                None => return false,
            }
        };
        debug!(target: "tessera::clients", client_id, %node, "Client unreachable from every node");
        self.submit(tasks);
        true
    }

    /// Disconnect every client that listed `node`.
    ///
    /// Returns the ids of clients that became unreachable.
    pub fn node_left(&self, node: &NodeAddress, left_at: DateTime<Utc>) -> Vec<String> {
        let (gone, tasks) = {
            let mut state = self.shared.state.lock();
            let listed: Vec<String> = state
                .clients
                .iter()
                .filter(|(_, c)| c.nodes.contains(node))
                .map(|(id, _)| id.clone())
                .collect();

            let mut gone = Vec::new();
            let mut tasks = Vec::new();
            for client_id in listed {
                if let Some(info) = Self::detach(&mut state, &client_id, node) {
                    tasks.extend(self.schedule_death(&mut state, &client_id, info, left_at));
                    gone.push(client_id);
                }
            }
            (gone, tasks)
        };

        info!(target: "tessera::clients", %node, unreachable = gone.len(), "Node left");
        self.submit(tasks);
        gone
    }

    pub fn is_client_connected(&self, client_id: &str) -> bool {
        self.shared.state.lock().clients.contains_key(client_id)
    }

    /// Connected, or unreachable but still inside a grace period
    pub fn is_client_connected_or_potentially_dead(&self, client_id: &str) -> bool {
        let state = self.shared.state.lock();
        state.clients.contains_key(client_id) || state.has_pending(client_id)
    }

    pub fn client_nodes(&self, client_id: &str) -> Vec<NodeAddress> {
        self.shared
            .state
            .lock()
            .clients
            .get(client_id)
            .map(|c| c.nodes.to_vec())
            .unwrap_or_default()
    }

    pub fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        self.shared
            .state
            .lock()
            .clients
            .get(client_id)
            .map(|c| c.info.clone())
    }

    /// Every connected client, ordered by id
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        let state = self.shared.state.lock();
        let mut infos: Vec<ClientInfo> = state.clients.values().map(|c| c.info.clone()).collect();
        infos.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every pending death task, e.g. when the cache stops
    pub fn cancel_all(&self) {
        let mut state = self.shared.state.lock();
        for (_, tasks) in state.pending.drain() {
            tasks.iter().for_each(|t| t.cancel());
        }
    }

    /// Drops `node`; the client's info when it has no nodes left
    fn detach(state: &mut LedgerState, client_id: &str, node: &NodeAddress) -> Option<ClientInfo> {
        let client = state.clients.get_mut(client_id)?;
        let before = client.nodes.len();
        client.nodes.retain(|n| n != node);
        if client.nodes.len() == before || !client.nodes.is_empty() {
            return None;
        }
        state.clients.remove(client_id).map(|c| {
            let mut info = c.info;
            info.status = ConnectivityStatus::Disconnected;
            info
        })
    }

    fn schedule_death(
        &self,
        state: &mut LedgerState,
        client_id: &str,
        info: ClientInfo,
        disconnected_at: DateTime<Utc>,
    ) -> Vec<Arc<DeadClientTask>> {
        let tasks: Vec<Arc<DeadClientTask>> = self
            .specs
            .read()
            .iter()
            .map(|spec| {
                Arc::new(DeadClientTask {
                    death: ClientDeath {
                        client_id: client_id.to_string(),
                        info: info.clone(),
                        kind: spec.kind,
                        disconnected_at,
                    },
                    grace_period: spec.grace_period,
                    callback: Arc::clone(&spec.callback),
                    cancelled: AtomicBool::new(false),
                    done: AtomicBool::new(false),
                    ledger: Arc::downgrade(&self.shared),
                })
            })
            .collect();

        if !tasks.is_empty() {
            state
                .pending
                .entry(client_id.to_string())
                .or_default()
                .extend(tasks.iter().cloned());
        }
        tasks
    }

    fn submit(&self, tasks: Vec<Arc<DeadClientTask>>) {
        for task in tasks {
            let client_id = task.death.client_id.clone();
            if let Err(e) = self.scheduler.add_task(task.clone()) {
                warn!(target: "tessera::clients", %client_id, error = %e, "Could not schedule death notification");
                task.cancel();
            }
        }
    }
}

impl std::fmt::Debug for ConnectedClientsLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClientsLedger")
            .field("clients", &self.len())
            .field("notifications", &self.specs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new("10.0.0.1", port)
    }

    fn setup(grace: Duration) -> (ConnectedClientsLedger, Arc<ManualScheduler>, Arc<Mutex<Vec<String>>>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let ledger = ConnectedClientsLedger::new(scheduler.clone());
        let deaths = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deaths);
        ledger.register_notification(NotificationSpec::new(
            NotificationKind::DeathNotification,
            grace,
            move |d| sink.lock().push(d.client_id.clone()),
        ));
        (ledger, scheduler, deaths)
    }

    #[test]
    fn test_connect_outcomes() {
        let (ledger, _, _) = setup(Duration::from_secs(5));
        assert_eq!(
            ledger.client_connected("c1", ClientInfo::new("c1"), node(1)),
            ConnectOutcome::NewClient
        );
        assert_eq!(
            ledger.client_connected("c1", ClientInfo::new("c1"), node(1)),
            ConnectOutcome::Duplicate
        );
        assert_eq!(
            ledger.client_connected("c1", ClientInfo::new("c1"), node(2)),
            ConnectOutcome::AdditionalNode
        );
        assert_eq!(ledger.client_nodes("c1"), vec![node(1), node(2)]);
    }

    #[test]
    fn test_disconnect_unknown_node_is_false() {
        let (ledger, scheduler, _) = setup(Duration::from_secs(5));
        ledger.client_connected("c1", ClientInfo::new("c1"), node(1));
        assert!(!ledger.client_disconnected("c1", &node(9), Utc::now()));
        assert!(!ledger.client_disconnected("nobody", &node(1), Utc::now()));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_reconnect_reports_reconnected() {
        let (ledger, scheduler, deaths) = setup(Duration::from_secs(5));
        ledger.client_connected("c1", ClientInfo::new("c1"), node(1));
        assert!(ledger.client_disconnected("c1", &node(1), Utc::now()));
        assert!(!ledger.is_client_connected("c1"));
        assert!(ledger.is_client_connected_or_potentially_dead("c1"));

        assert_eq!(
            ledger.client_connected("c1", ClientInfo::new("c1"), node(2)),
            ConnectOutcome::Reconnected
        );
        scheduler.advance(Duration::from_secs(10));
        assert!(deaths.lock().is_empty());
    }

    #[test]
    fn test_disconnected_status_is_reported() {
        let scheduler = Arc::new(ManualScheduler::new());
        let ledger = ConnectedClientsLedger::new(scheduler.clone());
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        ledger.register_notification(NotificationSpec::new(
            NotificationKind::DeathDetection,
            Duration::from_secs(1),
            move |d| *sink.lock() = Some(d.clone()),
        ));

        ledger.client_connected("c1", ClientInfo::new("c1").with_app_name("billing"), node(1));
        ledger.client_disconnected("c1", &node(1), Utc::now());
        scheduler.advance(Duration::from_secs(1));

        let death = seen.lock().clone().unwrap();
        assert_eq!(death.kind, NotificationKind::DeathDetection);
        assert_eq!(death.info.status, ConnectivityStatus::Disconnected);
        assert_eq!(death.info.app_name.as_deref(), Some("billing"));
    }

    #[test]
    fn test_cancel_all() {
        let (ledger, scheduler, deaths) = setup(Duration::from_secs(1));
        ledger.client_connected("c1", ClientInfo::new("c1"), node(1));
        ledger.client_disconnected("c1", &node(1), Utc::now());
        ledger.cancel_all();
        assert!(!ledger.is_client_connected_or_potentially_dead("c1"));
        scheduler.advance(Duration::from_secs(2));
        assert!(deaths.lock().is_empty());
    }
}

//! Cascading dependency removal
//!
//! When an entry is removed or replaced, every entry registered as depending
//! on it is removed too, and so on transitively. Each level is removed in one
//! storage batch. A visited set keyed by entry key guarantees each key is
//! considered at most once per top-level call, whatever cycles the
//! dependency metadata contains.
//!
//! Cascades are local only: nothing here reaches the backing data source.

use rustc_hash::FxHashSet;
use std::sync::Arc;
use tessera_core::{CacheEntry, CacheImpl, OperationContext, Result, WriteResult};
use tracing::debug;

/// Entries removed by one cascade, in removal order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CascadeReport {
    pub removed: Vec<(String, CacheEntry)>,
}

impl CascadeReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removed.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(|(k, _)| k.as_str())
    }

    fn merge(&mut self, other: CascadeReport) {
        self.removed.extend(other.removed);
    }
}

pub struct CascadeDependencyResolver {
    storage: Arc<dyn CacheImpl>,
}

impl CascadeDependencyResolver {
    pub fn new(storage: Arc<dyn CacheImpl>) -> Self {
        Self { storage }
    }

    /// After `key` was overwritten; `previous` is the replaced entry.
    pub fn after_insert(
        &self,
        key: &str,
        previous: Option<&CacheEntry>,
        ctx: &OperationContext,
    ) -> Result<CascadeReport> {
        match previous {
            Some(entry) if !entry.dependents.is_empty() => {
                self.cascade(vec![(key.to_string(), entry)], ctx)
            }
            _ => Ok(CascadeReport::default()),
        }
    }

    /// After `key` was removed; `removed` is the entry that left.
    pub fn after_remove(
        &self,
        key: &str,
        removed: &CacheEntry,
        ctx: &OperationContext,
    ) -> Result<CascadeReport> {
        if removed.dependents.is_empty() {
            return Ok(CascadeReport::default());
        }
        self.cascade(vec![(key.to_string(), removed)], ctx)
    }

    /// One pass over a whole bulk outcome.
    ///
    /// Roots are the keys whose write committed and handed back a previous
    /// entry. A key that is itself a root is never removed as a dependent.
    pub fn after_bulk(
        &self,
        results: &[(String, WriteResult)],
        ctx: &OperationContext,
    ) -> Result<CascadeReport> {
        let roots: Vec<(String, &CacheEntry)> = results
            .iter()
            .filter(|(_, r)| r.outcome.is_success())
            .filter_map(|(k, r)| r.previous.as_ref().map(|e| (k.clone(), e)))
            .collect();
        if roots.iter().all(|(_, e)| e.dependents.is_empty()) {
            return Ok(CascadeReport::default());
        }
        self.cascade(roots, ctx)
    }

    fn cascade(&self, roots: Vec<(String, &CacheEntry)>, ctx: &OperationContext) -> Result<CascadeReport> {
        let mut visited: FxHashSet<String> = roots.iter().map(|(k, _)| k.clone()).collect();
        let mut frontier: Vec<String> = Vec::new();
        for (_, entry) in &roots {
            enqueue(&mut frontier, &mut visited, entry);
        }

        let mut report = CascadeReport::default();
        let mut depth = 0;
        while !frontier.is_empty() {
            depth += 1;
            debug!(target: "tessera::cascade", depth, batch = frontier.len(), "Removing dependents");
            let removed = self.storage.remove_cascading_dependencies(&frontier, ctx)?;

            let mut next = Vec::new();
            for (_, entry) in &removed {
                enqueue(&mut next, &mut visited, entry);
            }
            report.merge(CascadeReport { removed });
            frontier = next;
        }
        Ok(report)
    }
}

fn enqueue(frontier: &mut Vec<String>, visited: &mut FxHashSet<String>, entry: &CacheEntry) {
    for dependent in &entry.dependents {
        if visited.insert(dependent.clone()) {
            frontier.push(dependent.clone());
        }
    }
}

impl std::fmt::Debug for CascadeDependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeDependencyResolver").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{KeyDependency, LockRequest, RemoveReason};
    use tessera_storage::LocalStore;

    fn store() -> Arc<LocalStore> {
        Arc::new(LocalStore::new())
    }

    fn put(store: &LocalStore, key: &str, deps: &[&str]) {
        let mut entry = CacheEntry::new(key);
        if !deps.is_empty() {
            entry = entry.with_dependency(KeyDependency::on(deps.iter().copied()));
        }
        let result = store
            .insert(key, entry, &LockRequest::ignore_lock(), &OperationContext::new())
            .unwrap();
        assert!(result.outcome.is_success(), "{} -> {:?}", key, result.outcome);
    }

    fn remove(store: &LocalStore, key: &str) -> CacheEntry {
        store
            .remove(key, RemoveReason::Removed, &LockRequest::ignore_lock(), &OperationContext::new())
            .unwrap()
            .previous
            .unwrap()
    }

    #[test]
    fn test_removing_parent_removes_dependents_once() {
        let s = store();
        put(&s, "a", &[]);
        put(&s, "c", &["a"]);
        put(&s, "b", &["a", "c"]);
        put(&s, "d", &["a"]);

        let resolver = CascadeDependencyResolver::new(s.clone());
        let removed = remove(&s, "a");
        let report = resolver.after_remove("a", &removed, &OperationContext::new()).unwrap();

        let mut keys: Vec<_> = report.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["b", "c", "d"]);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_transitive_chain() {
        let s = store();
        put(&s, "root", &[]);
        put(&s, "mid", &["root"]);
        put(&s, "leaf", &["mid"]);

        let resolver = CascadeDependencyResolver::new(s.clone());
        let removed = remove(&s, "root");
        let report = resolver.after_remove("root", &removed, &OperationContext::new()).unwrap();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["mid", "leaf"]);
    }

    #[test]
    fn test_overwrite_keeps_root() {
        let s = store();
        put(&s, "a", &[]);
        put(&s, "b", &["a"]);

        let resolver = CascadeDependencyResolver::new(s.clone());
        let result = s
            .insert("a", CacheEntry::new("a2"), &LockRequest::ignore_lock(), &OperationContext::new())
            .unwrap();
        let report = resolver
            .after_insert("a", result.previous.as_ref(), &OperationContext::new())
            .unwrap();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(s.peek("a").is_some());
        assert!(s.peek("b").is_none());
    }

    #[test]
    fn test_diamond_removes_shared_dependent_once() {
        let s = store();
        put(&s, "root", &[]);
        put(&s, "x", &["root"]);
        put(&s, "y", &["root"]);
        put(&s, "z", &["x", "y"]);

        let resolver = CascadeDependencyResolver::new(s.clone());
        let removed = remove(&s, "root");
        let report = resolver.after_remove("root", &removed, &OperationContext::new()).unwrap();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["x", "y", "z"]);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_no_dependents_is_noop() {
        let s = store();
        put(&s, "a", &[]);
        let resolver = CascadeDependencyResolver::new(s.clone());
        let removed = remove(&s, "a");
        assert!(resolver.after_remove("a", &removed, &OperationContext::new()).unwrap().is_empty());
    }
}

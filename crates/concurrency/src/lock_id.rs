//! Lock handle generation
//!
//! Lock ids have the shape `pid-host-key-counter`. The counter is process-wide
//! per generator, so two grants on the same key never share an id.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::LockId;

/// Produces unique lock ids for this process
#[derive(Debug)]
pub struct LockIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl LockIdGenerator {
    pub fn new() -> Self {
        Self::with_host(host_name())
    }

    /// Generator with an explicit host component
    pub fn with_host(host: impl AsRef<str>) -> Self {
        LockIdGenerator {
            prefix: format!("{}-{}", std::process::id(), host.as_ref()),
            counter: AtomicU64::new(0),
        }
    }

    /// Next id for `key`
    pub fn next(&self, key: &str) -> LockId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        LockId::new(format!("{}-{}-{}", self.prefix, key, n))
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for LockIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_shape() {
        let gen = LockIdGenerator::with_host("node-a");
        let id = gen.next("user:1");
        let expected = format!("{}-node-a-user:1-1", std::process::id());
        assert_eq!(id.as_str(), expected);
    }

    #[test]
    fn test_counter_is_monotonic() {
        let gen = LockIdGenerator::with_host("h");
        let a = gen.next("k");
        let b = gen.next("k");
        assert_ne!(a, b);
        assert!(b.as_str().ends_with("-2"));
        assert_eq!(gen.issued(), 2);
    }

    #[test]
    fn test_ids_unique_across_keys() {
        let gen = LockIdGenerator::with_host("h");
        let ids: HashSet<_> = (0..100).map(|i| gen.next(&format!("k{}", i % 3))).collect();
        assert_eq!(ids.len(), 100);
    }
}

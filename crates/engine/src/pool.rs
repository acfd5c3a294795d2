//! Thread-local entry pool
//!
//! Reuses `CacheEntry` shells so the write path does not reallocate the
//! dependents set and other collections on every call. Each thread keeps up
//! to [`MAX_POOL_SIZE`] shells; nothing is shared between threads.
//!
//! A shell handed out by [`EntryPool::acquire`] belongs to the caller until it
//! is moved into the storage engine or given back with [`EntryPool::release`].

use std::cell::RefCell;
use tessera_core::{CacheEntry, Timestamp, Value};

/// Maximum shells per thread
pub const MAX_POOL_SIZE: usize = 8;

thread_local! {
    static ENTRY_POOL: RefCell<Vec<CacheEntry>> = RefCell::new(Vec::with_capacity(MAX_POOL_SIZE));
}

pub struct EntryPool;

impl EntryPool {
    /// A reset entry holding `value`, stamped with the current time
    pub fn acquire(value: Value) -> CacheEntry {
        let now = Timestamp::now();
        let mut entry = ENTRY_POOL
            .with(|pool| pool.borrow_mut().pop())
            .unwrap_or_default();
        entry.value = value;
        entry.created_at = now;
        entry.last_modified = now;
        entry.last_accessed = now;
        entry
    }

    /// Return a shell. It is reset here; dropped if the pool is full.
    pub fn release(mut entry: CacheEntry) {
        entry.reset();
        ENTRY_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOL_SIZE {
                pool.push(entry);
            }
        });
    }

    pub fn pool_size() -> usize {
        ENTRY_POOL.with(|pool| pool.borrow().len())
    }

    /// Pre-allocate up to `count` shells on this thread
    pub fn warmup(count: usize) {
        let count = count.min(MAX_POOL_SIZE);
        ENTRY_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            while pool.len() < count {
                pool.push(CacheEntry::default());
            }
        });
    }

    #[cfg(test)]
    pub fn clear() {
        ENTRY_POOL.with(|pool| pool.borrow_mut().clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{EntryFlags, LockId, LockState};

    #[test]
    fn test_acquire_from_empty_pool_allocates() {
        EntryPool::clear();
        let entry = EntryPool::acquire(Value::from("v"));
        assert_eq!(entry.value, Value::from("v"));
        assert_eq!(entry.version, 0);
        assert_eq!(EntryPool::pool_size(), 0);
    }

    #[test]
    fn test_released_shell_comes_back_clean() {
        EntryPool::clear();
        let mut entry = EntryPool::acquire(Value::from("v"));
        entry.version = 42;
        entry.flags = EntryFlags::WRITE_THRU;
        entry.lock = Some(LockState::new(LockId::from("l"), Timestamp::now(), None));
        entry.dependents.insert("child".into());
        EntryPool::release(entry);
        assert_eq!(EntryPool::pool_size(), 1);

        let reused = EntryPool::acquire(Value::from("w"));
        assert_eq!(reused.value, Value::from("w"));
        assert_eq!(reused.version, 0);
        assert!(reused.flags.is_empty());
        assert!(reused.lock.is_none());
        assert!(reused.dependents.is_empty());
        assert_eq!(EntryPool::pool_size(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        EntryPool::clear();
        for _ in 0..MAX_POOL_SIZE + 5 {
            EntryPool::release(CacheEntry::default());
        }
        assert_eq!(EntryPool::pool_size(), MAX_POOL_SIZE);
    }

    #[test]
    fn test_pools_are_per_thread() {
        EntryPool::clear();
        EntryPool::warmup(4);
        let other = std::thread::spawn(EntryPool::pool_size).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(EntryPool::pool_size(), 4);
    }
}

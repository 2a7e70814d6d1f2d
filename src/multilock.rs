use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Mutual exclusion over a dynamically changing set of keys.
///
/// Provides locking for a potentially large key space without allocating a
/// lock per key: a single set records which keys are currently held, and all
/// waiters share one condition variable. Only holders of the same key block
/// each other. The set of keys held at any instant is bounded by the number
/// of in-flight requests, so the broadcast wakeup stays cheap.
///
/// There is no fairness guarantee, and locking is not reentrant: acquiring a
/// key already held by the same thread deadlocks.
pub struct MultiLock {
    locked_keys: Mutex<HashSet<String>>,
    cond: Condvar,
}

/// Holds a key locked until dropped.
pub struct KeyGuard<'a> {
    lock: &'a MultiLock,
    key: String,
}

impl MultiLock {
    pub fn new() -> MultiLock {
        MultiLock {
            locked_keys: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock for `key`, releasing it when the guard is dropped.
    pub fn lock(&self, key: &str) -> KeyGuard {
        self.acquire(key);
        KeyGuard {
            lock: self,
            key: key.to_owned(),
        }
    }

    /// Acquire the lock for the given key.
    pub fn acquire(&self, key: &str) {
        let mut locked_keys = self.locked_keys.lock().unwrap();
        while locked_keys.contains(key) {
            locked_keys = self.cond.wait(locked_keys).unwrap();
        }
        locked_keys.insert(key.to_owned());
    }

    /// Release the lock on the given key.
    pub fn release(&self, key: &str) {
        let mut locked_keys = self.locked_keys.lock().unwrap();
        locked_keys.remove(key);
        // A waiter may be parked on any key; with one shared condition
        // variable a targeted wakeup is not possible.
        self.cond.notify_all();
    }
}

impl Default for MultiLock {
    fn default() -> MultiLock {
        MultiLock::new()
    }
}

impl<'a> Drop for KeyGuard<'a> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use sproxy_common::CredentialId;

/// Per-credential mutual exclusion for the image flow.
///
/// The upstream rejects concurrent image creations on one credential, so one
/// create runs at a time per credential. Entries older than the timeout are
/// treated as stale and silently released; ownership is neither re-entrant
/// nor fair. Reset to empty at process start.
#[derive(Debug, Default)]
pub struct TokenLock {
    entries: Mutex<HashMap<CredentialId, Instant>>,
}

impl TokenLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, id: CredentialId, timeout: Duration) -> bool {
        let mut entries = self.entries.lock().expect("token lock poisoned");
        if let Some(acquired_at) = entries.get(&id) {
            if acquired_at.elapsed() <= timeout {
                return false;
            }
            debug!(event = "token_lock_stale", credential_id = id);
            entries.remove(&id);
        }
        entries.insert(id, Instant::now());
        true
    }

    pub fn release(&self, id: CredentialId) {
        let mut entries = self.entries.lock().expect("token lock poisoned");
        entries.remove(&id);
    }

    pub fn is_locked(&self, id: CredentialId, timeout: Duration) -> bool {
        let mut entries = self.entries.lock().expect("token lock poisoned");
        match entries.get(&id) {
            Some(acquired_at) if acquired_at.elapsed() <= timeout => true,
            Some(_) => {
                entries.remove(&id);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(300);

    #[test]
    fn exclusive_until_released() {
        let lock = TokenLock::new();
        assert!(lock.try_acquire(1, LONG));
        assert!(!lock.try_acquire(1, LONG));
        assert!(lock.is_locked(1, LONG));
        // Other credentials are independent.
        assert!(lock.try_acquire(2, LONG));

        lock.release(1);
        assert!(!lock.is_locked(1, LONG));
        assert!(lock.try_acquire(1, LONG));
    }

    #[test]
    fn stale_entry_self_expires() {
        let lock = TokenLock::new();
        assert!(lock.try_acquire(1, Duration::ZERO));
        std::thread::sleep(Duration::from_millis(10));
        // Past the timeout the entry no longer counts as held.
        assert!(!lock.is_locked(1, Duration::ZERO));
        assert!(lock.try_acquire(1, Duration::ZERO));
    }

    #[test]
    fn release_is_idempotent() {
        let lock = TokenLock::new();
        lock.release(7);
        assert!(lock.try_acquire(7, LONG));
        lock.release(7);
        lock.release(7);
        assert!(!lock.is_locked(7, LONG));
    }
}

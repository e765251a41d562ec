use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use sproxy_common::CredentialId;
use sproxy_storage::CredentialRecord;

#[derive(Debug, Default)]
struct Slots {
    image: HashMap<CredentialId, i32>,
    video: HashMap<CredentialId, i32>,
}

/// Per-credential image/video slot counters, seeded from the persisted
/// ceilings at startup. A non-positive ceiling means unbounded and the id is
/// simply not tracked; unknown ids always pass.
#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    slots: Mutex<Slots>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, credentials: &[CredentialRecord]) {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        slots.image.clear();
        slots.video.clear();
        for cred in credentials {
            if cred.image_concurrency > 0 {
                slots.image.insert(cred.id, cred.image_concurrency);
            }
            if cred.video_concurrency > 0 {
                slots.video.insert(cred.id, cred.video_concurrency);
            }
        }
        debug!(event = "limiter_seeded", credentials = credentials.len());
    }

    pub fn can_use_image(&self, id: CredentialId) -> bool {
        let slots = self.slots.lock().expect("limiter lock poisoned");
        slots.image.get(&id).is_none_or(|remaining| *remaining > 0)
    }

    pub fn can_use_video(&self, id: CredentialId) -> bool {
        let slots = self.slots.lock().expect("limiter lock poisoned");
        slots.video.get(&id).is_none_or(|remaining| *remaining > 0)
    }

    pub fn acquire_image(&self, id: CredentialId) -> bool {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        match slots.image.get_mut(&id) {
            None => true,
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            Some(_) => false,
        }
    }

    pub fn acquire_video(&self, id: CredentialId) -> bool {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        match slots.video.get_mut(&id) {
            None => true,
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            Some(_) => false,
        }
    }

    pub fn release_image(&self, id: CredentialId) {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        if let Some(remaining) = slots.image.get_mut(&id) {
            *remaining += 1;
        }
    }

    pub fn release_video(&self, id: CredentialId) {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        if let Some(remaining) = slots.video.get_mut(&id) {
            *remaining += 1;
        }
    }

    /// Full reset to new ceilings when a credential's limits change.
    pub fn reset(&self, id: CredentialId, image_concurrency: i32, video_concurrency: i32) {
        let mut slots = self.slots.lock().expect("limiter lock poisoned");
        if image_concurrency > 0 {
            slots.image.insert(id, image_concurrency);
        } else {
            slots.image.remove(&id);
        }
        if video_concurrency > 0 {
            slots.video.insert(id, video_concurrency);
        } else {
            slots.video.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(id: CredentialId, image: i32, video: i32) -> ConcurrencyLimiter {
        let limiter = ConcurrencyLimiter::new();
        limiter.reset(id, image, video);
        limiter
    }

    #[test]
    fn bounded_slots_drain_and_refill() {
        let limiter = limiter_with(1, 2, 1);
        assert!(limiter.acquire_image(1));
        assert!(limiter.acquire_image(1));
        assert!(!limiter.acquire_image(1));
        assert!(!limiter.can_use_image(1));

        limiter.release_image(1);
        assert!(limiter.can_use_image(1));
        assert!(limiter.acquire_image(1));

        assert!(limiter.acquire_video(1));
        assert!(!limiter.acquire_video(1));
    }

    #[test]
    fn unknown_ids_are_unbounded() {
        let limiter = ConcurrencyLimiter::new();
        assert!(limiter.can_use_image(42));
        assert!(limiter.acquire_video(42));
        // Releasing an untracked id must not start tracking it.
        limiter.release_video(42);
        assert!(limiter.acquire_video(42));
        assert!(limiter.acquire_video(42));
    }

    #[test]
    fn reset_replaces_ceilings() {
        let limiter = limiter_with(1, 1, 1);
        assert!(limiter.acquire_image(1));
        assert!(!limiter.can_use_image(1));

        limiter.reset(1, 3, -1);
        assert!(limiter.acquire_image(1));
        assert!(limiter.acquire_image(1));
        assert!(limiter.acquire_image(1));
        assert!(!limiter.acquire_image(1));
        // Video became unbounded.
        for _ in 0..5 {
            assert!(limiter.acquire_video(1));
        }
    }
}

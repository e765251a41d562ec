use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use time::OffsetDateTime;
use tracing::{info, warn};

use sproxy_storage::{CredentialRecord, Storage, StorageResult};
use sproxy_upstream::SoraClient;

use crate::limiter::ConcurrencyLimiter;
use crate::token_lock::TokenLock;

/// Predicates passed by the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectRequest {
    pub for_image: bool,
    pub for_video: bool,
    pub require_pro: bool,
}

/// Filters active credentials by the request predicates and picks one
/// uniformly at random from the eligible set. Selection never blocks on a
/// token refresh; that runs in a background worker.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    client: Arc<SoraClient>,
    lock: Arc<TokenLock>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<SoraClient>,
        lock: Arc<TokenLock>,
        limiter: Arc<ConcurrencyLimiter>,
    ) -> Self {
        Self {
            storage,
            client,
            lock,
            limiter,
        }
    }

    pub async fn select(
        &self,
        request: SelectRequest,
        lock_timeout: Duration,
    ) -> StorageResult<Option<CredentialRecord>> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.storage.list_credentials().await?;

        // A just-expired Sora2 cooldown gets one remaining-quota refresh
        // before the filter decides.
        if request.for_video {
            for row in &mut rows {
                let cooldown_expired = row
                    .sora2_cooldown_until
                    .is_some_and(|until| until <= now);
                if !cooldown_expired || !row.is_active(now) {
                    continue;
                }
                self.refresh_sora2_quota(row).await;
            }
        }

        let eligible = filter_eligible(
            rows,
            request,
            now,
            &self.lock,
            &self.limiter,
            lock_timeout,
        );
        if eligible.is_empty() {
            return Ok(None);
        }
        let chosen = eligible
            .choose(&mut rand::rng())
            .cloned()
            .expect("non-empty eligible set");
        info!(
            event = "credential_selected",
            credential_id = chosen.id,
            eligible = eligible.len(),
            for_image = request.for_image,
            for_video = request.for_video,
        );
        Ok(Some(chosen))
    }

    async fn refresh_sora2_quota(&self, row: &mut CredentialRecord) {
        match self.client.video_remaining(&row.access_token).await {
            Ok(Some(remaining)) => {
                let remaining = remaining.max(0) as i32;
                let _ = self.storage.set_sora2_remaining(row.id, remaining).await;
                if remaining > 0 {
                    let _ = self.storage.set_sora2_cooldown(row.id, None).await;
                    row.sora2_cooldown_until = None;
                } else {
                    // Quota still exhausted: re-arm so the filter keeps
                    // skipping this credential for a while.
                    let until = OffsetDateTime::now_utc() + time::Duration::hours(1);
                    let _ = self.storage.set_sora2_cooldown(row.id, Some(until)).await;
                    row.sora2_cooldown_until = Some(until);
                }
                row.sora2_remaining_count = remaining;
            }
            Ok(None) => {
                // Endpoint did not report a count; clear the stale cooldown.
                let _ = self.storage.set_sora2_cooldown(row.id, None).await;
                row.sora2_cooldown_until = None;
            }
            Err(err) => {
                warn!(
                    event = "sora2_quota_refresh_failed",
                    credential_id = row.id,
                    %err
                );
            }
        }
    }
}

/// Pure predicate filter, ordered as the selection pipeline applies them.
pub(crate) fn filter_eligible(
    rows: Vec<CredentialRecord>,
    request: SelectRequest,
    now: OffsetDateTime,
    lock: &TokenLock,
    limiter: &ConcurrencyLimiter,
    lock_timeout: Duration,
) -> Vec<CredentialRecord> {
    rows.into_iter()
        .filter(|row| row.is_active(now))
        .filter(|row| !request.require_pro || row.is_pro())
        .filter(|row| {
            if !request.for_video {
                return true;
            }
            if !row.video_enabled || !row.sora2_supported {
                return false;
            }
            if row
                .sora2_cooldown_until
                .is_some_and(|until| until > now)
            {
                return false;
            }
            limiter.can_use_video(row.id)
        })
        .filter(|row| {
            if !request.for_image {
                return true;
            }
            row.image_enabled
                && !lock.is_locked(row.id, lock_timeout)
                && limiter.can_use_image(row.id)
        })
        .collect()
}

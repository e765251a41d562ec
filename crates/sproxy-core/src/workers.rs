use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use sproxy_upstream::refresh_access_token;

use crate::state::AppState;

const EVICTION_INTERVAL: Duration = Duration::from_secs(300);
const REFRESH_INTERVAL: Duration = Duration::from_secs(1800);
const REFRESH_WINDOW_HOURS: i64 = 24;

/// Periodic cache eviction; wakes every 5 minutes and applies the configured
/// TTL (sentinel -1 skips the sweep entirely).
pub fn spawn_cache_eviction(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ttl = state.settings().cache.timeout_secs;
            if ttl < 0 {
                continue;
            }
            let removed = state.cache.evict_expired(ttl).await;
            if removed > 0 {
                info!(event = "cache_evicted", removed);
            }
        }
    });
}

/// Background access-token refresh for credentials expiring within 24 hours.
/// Runs off the hot selection path so selection never blocks on the network.
pub fn spawn_token_refresh(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !state.settings().refresh.auto_refresh_enabled {
                continue;
            }
            if let Err(err) = refresh_expiring(&state).await {
                warn!(event = "token_refresh_sweep_failed", error = %err);
            }
        }
    });
}

async fn refresh_expiring(state: &Arc<AppState>) -> Result<(), sproxy_storage::StorageError> {
    let now = OffsetDateTime::now_utc();
    let cutoff = now + time::Duration::hours(REFRESH_WINDOW_HOURS);
    let rows = state.storage.list_credentials().await?;

    for row in rows {
        if !row.enabled || row.expired {
            continue;
        }
        let Some(expiry) = row.expiry_time else {
            continue;
        };
        if expiry > cutoff {
            continue;
        }
        let (Some(refresh_token), Some(client_id)) =
            (row.refresh_token.as_deref(), row.client_id.as_deref())
        else {
            continue;
        };

        match refresh_access_token(&state.client, client_id, refresh_token).await {
            Ok(tokens) => {
                state
                    .storage
                    .set_access_token(row.id, &tokens.access_token, tokens.expiry_time)
                    .await?;
                info!(event = "access_token_refreshed", credential_id = row.id);
            }
            Err(err) => {
                warn!(
                    event = "access_token_refresh_failed",
                    credential_id = row.id,
                    error = %err
                );
            }
        }
    }
    Ok(())
}

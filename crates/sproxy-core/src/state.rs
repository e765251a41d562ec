use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use sproxy_common::GatewaySettings;
use sproxy_storage::{CredentialRecord, Storage, StorageResult};
use sproxy_upstream::SoraClient;

use crate::cache::FileCache;
use crate::limiter::ConcurrencyLimiter;
use crate::scheduler::Scheduler;
use crate::token_lock::TokenLock;

/// Shared runtime state. Config reads go through an atomically swapped
/// snapshot; no component holds a long-lived copy.
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub client: Arc<SoraClient>,
    pub lock: Arc<TokenLock>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub cache: Arc<FileCache>,
    settings: ArcSwap<GatewaySettings>,
    /// `host:port` the server is reachable at; cache URLs fall back to it.
    public_address: String,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<SoraClient>,
        cache: Arc<FileCache>,
        settings: GatewaySettings,
        public_address: String,
    ) -> Self {
        Self {
            storage,
            client,
            lock: Arc::new(TokenLock::new()),
            limiter: Arc::new(ConcurrencyLimiter::new()),
            cache,
            settings: ArcSwap::from_pointee(settings),
            public_address,
        }
    }

    pub fn settings(&self) -> Arc<GatewaySettings> {
        self.settings.load_full()
    }

    /// Re-reads the config rows and swaps the snapshot.
    pub async fn reload_settings(&self) -> StorageResult<()> {
        let fresh = self.storage.load_settings().await?;
        self.settings.store(Arc::new(fresh));
        Ok(())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.storage.clone(),
            self.client.clone(),
            self.lock.clone(),
            self.limiter.clone(),
        )
    }

    /// The image-flow lock self-expires on the image generation budget.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.settings().generation.image_timeout_secs)
    }

    /// Base URL cached artifacts are served under.
    pub fn cache_base_url(&self) -> String {
        let settings = self.settings();
        match settings
            .cache
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.public_address),
        }
    }

    /// Per-credential proxy wins over the global one; blank means none.
    pub fn resolve_proxy(&self, credential: &CredentialRecord) -> Option<String> {
        if let Some(proxy) = credential
            .proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            return Some(proxy.to_string());
        }
        self.settings().proxy.effective_url().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sproxy_common::ProxySettings;
    use sproxy_storage::SeaOrmStorage;

    async fn state_with(settings: GatewaySettings) -> AppState {
        let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
        let cache = FileCache::new(
            std::env::temp_dir().join(format!("sproxy-state-{}", uuid::Uuid::new_v4())),
        )
        .unwrap();
        AppState::new(
            Arc::new(storage),
            Arc::new(SoraClient::new(None, Duration::from_secs(5))),
            Arc::new(cache),
            settings,
            "127.0.0.1:8000".to_string(),
        )
    }

    fn record_with_proxy(proxy: Option<&str>) -> CredentialRecord {
        CredentialRecord {
            id: 1,
            email: "a@b.c".to_string(),
            access_token: "at".to_string(),
            session_token: None,
            refresh_token: None,
            client_id: None,
            proxy_url: proxy.map(str::to_string),
            expiry_time: None,
            enabled: true,
            expired: false,
            cooled_until: None,
            plan_type: None,
            subscription_end: None,
            sora2_supported: true,
            sora2_remaining_count: 0,
            sora2_cooldown_until: None,
            image_enabled: true,
            video_enabled: true,
            image_concurrency: -1,
            video_concurrency: -1,
        }
    }

    #[tokio::test]
    async fn cache_base_falls_back_to_public_address() {
        let state = state_with(GatewaySettings::default()).await;
        assert_eq!(state.cache_base_url(), "http://127.0.0.1:8000");

        let mut settings = GatewaySettings::default();
        settings.cache.base_url = Some("https://cdn.example.com/".to_string());
        let state = state_with(settings).await;
        assert_eq!(state.cache_base_url(), "https://cdn.example.com");
    }

    #[tokio::test]
    async fn per_credential_proxy_takes_precedence() {
        let mut settings = GatewaySettings::default();
        settings.proxy = ProxySettings {
            enabled: true,
            url: Some("http://global:7890".to_string()),
        };
        let state = state_with(settings).await;

        let dedicated = record_with_proxy(Some("http://dedicated:1080"));
        assert_eq!(
            state.resolve_proxy(&dedicated).as_deref(),
            Some("http://dedicated:1080")
        );

        let shared = record_with_proxy(None);
        assert_eq!(
            state.resolve_proxy(&shared).as_deref(),
            Some("http://global:7890")
        );

        let blank = record_with_proxy(Some("   "));
        assert_eq!(
            state.resolve_proxy(&blank).as_deref(),
            Some("http://global:7890")
        );
    }
}

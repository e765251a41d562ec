use serde::{Deserialize, Serialize};

/// In-memory snapshot of the singleton config rows.
///
/// The running process reads this through an atomic-swap handle; admin-side
/// edits land in storage and are folded in on the next reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub admin: AdminSettings,
    pub proxy: ProxySettings,
    pub watermark: WatermarkSettings,
    pub cache: CacheSettings,
    pub generation: GenerationSettings,
    pub refresh: RefreshSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSettings {
    pub admin_username: String,
    pub admin_password: String,
    pub api_key: String,
    pub error_ban_threshold: i32,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            admin_password: "admin".to_string(),
            api_key: String::new(),
            error_ban_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: bool,
    pub url: Option<String>,
}

impl ProxySettings {
    pub fn effective_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.url.as_deref().filter(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkMethod {
    #[default]
    ThirdParty,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSettings {
    pub enabled: bool,
    pub method: WatermarkMethod,
    pub custom_url: Option<String>,
    pub custom_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// TTL in seconds; -1 disables eviction entirely.
    pub timeout_secs: i64,
    pub base_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 7200,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub image_timeout_secs: u64,
    pub video_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            image_timeout_secs: 300,
            video_timeout_secs: 1200,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshSettings {
    pub auto_refresh_enabled: bool,
}

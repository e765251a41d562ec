pub mod admin_config;
pub mod cache_config;
pub mod credential_stats;
pub mod credentials;
pub mod generation_config;
pub mod proxy_config;
pub mod refresh_config;
pub mod request_logs;
pub mod tasks;
pub mod watermark_config;

pub use admin_config::Entity as AdminConfig;
pub use cache_config::Entity as CacheConfig;
pub use credential_stats::Entity as CredentialStats;
pub use credentials::Entity as Credentials;
pub use generation_config::Entity as GenerationConfig;
pub use proxy_config::Entity as ProxyConfig;
pub use refresh_config::Entity as RefreshConfig;
pub use request_logs::Entity as RequestLogs;
pub use tasks::Entity as Tasks;
pub use watermark_config::Entity as WatermarkConfig;

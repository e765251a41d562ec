pub mod config;
pub mod error;

pub use config::{
    AdminSettings, CacheSettings, GatewaySettings, GenerationSettings, ProxySettings,
    RefreshSettings, WatermarkMethod, WatermarkSettings,
};
pub use error::{UpstreamError, UpstreamResult};

pub type CredentialId = i64;

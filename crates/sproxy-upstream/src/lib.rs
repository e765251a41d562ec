//! Wire-level Sora client: one HTTPS call per operation, impersonated
//! browser fingerprint, per-request anti-abuse token on creation calls.
//!
//! IO policy and error taxonomy live here; scheduling, persistence and
//! stream shaping are the core crate's business.

pub mod client;
pub mod refresh;
pub mod sentinel;
pub mod storyboard;
pub mod types;

pub use client::{CreateVideoParams, SoraClient, UploadImageParams};
pub use refresh::{RefreshedTokens, refresh_access_token};
pub use storyboard::{format_storyboard_prompt, is_storyboard_prompt};
pub use types::{
    CameoStatus, DraftItem, DraftList, ImageTask, PendingTask, RecentImageTasks,
    SentinelChallenge,
};

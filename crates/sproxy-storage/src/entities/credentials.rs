use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Natural key for imports; one active record per address.
    #[sea_orm(unique)]
    pub email: String,
    pub access_token: String,
    pub session_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub proxy_url: Option<String>,
    pub remark: Option<String>,
    pub expiry_time: Option<OffsetDateTime>,
    pub enabled: bool,
    /// Set on upstream 401; cleared only by admin.
    pub expired: bool,
    pub cooled_until: Option<OffsetDateTime>,
    pub plan_type: Option<String>,
    pub plan_title: Option<String>,
    pub subscription_end: Option<OffsetDateTime>,
    pub sora2_supported: bool,
    pub sora2_remaining_count: i32,
    pub sora2_cooldown_until: Option<OffsetDateTime>,
    pub image_enabled: bool,
    pub video_enabled: bool,
    /// Per-feature ceilings; non-positive means unbounded.
    pub image_concurrency: i32,
    pub video_concurrency: i32,
    pub use_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

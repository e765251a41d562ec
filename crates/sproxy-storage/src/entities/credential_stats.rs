use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credential_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub credential_id: i64,
    pub image_count: i64,
    pub video_count: i64,
    /// Lifetime error total; never reset.
    pub error_count: i64,
    pub last_error_at: Option<OffsetDateTime>,
    pub today_image_count: i64,
    pub today_video_count: i64,
    pub today_error_count: i64,
    /// Date stamp for the today_* counters; counters roll when it differs
    /// from the current date.
    pub today_date: Option<String>,
    pub consecutive_error_count: i32,
    #[sea_orm(belongs_to, from = "credential_id", to = "id", on_delete = "Cascade")]
    pub credential: HasOne<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

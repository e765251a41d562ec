use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "generation_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub image_timeout_secs: i64,
    pub video_timeout_secs: i64,
    pub poll_interval_secs: i64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "admin_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub admin_username: String,
    pub admin_password: String,
    pub api_key: String,
    pub error_ban_threshold: i32,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

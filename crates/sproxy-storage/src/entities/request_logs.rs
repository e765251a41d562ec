use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub credential_id: Option<i64>,
    pub task_id: Option<String>,
    pub operation: String,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    /// -1 while the operation is still in progress.
    pub status_code: i32,
    /// Seconds; -1.0 while in progress.
    pub duration: f64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}

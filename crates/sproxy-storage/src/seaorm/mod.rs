use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    QueryFilter, Schema,
};
use sea_orm::ConnectionTrait;
use time::OffsetDateTime;

use sproxy_common::{
    AdminSettings, CacheSettings, CredentialId, GatewaySettings, GenerationSettings,
    ProxySettings, RefreshSettings, WatermarkMethod, WatermarkSettings,
};

use crate::entities;
use crate::records::{
    CredentialRecord, NewRequestLog, NewTask, StatsRecord, TaskRecord, TaskStatus,
};
use crate::storage::{Storage, StorageError, StorageResult};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = crate::db::connect_shared(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn ensure_stats_row(
        &self,
        credential_id: CredentialId,
    ) -> StorageResult<entities::credential_stats::Model> {
        use entities::credential_stats::{ActiveModel as StatsActive, Column};

        if let Some(model) = entities::CredentialStats::find()
            .filter(Column::CredentialId.eq(credential_id))
            .one(&self.db)
            .await?
        {
            return Ok(model);
        }

        let active = StatsActive {
            id: ActiveValue::NotSet,
            credential_id: ActiveValue::Set(credential_id),
            image_count: ActiveValue::Set(0),
            video_count: ActiveValue::Set(0),
            error_count: ActiveValue::Set(0),
            last_error_at: ActiveValue::Set(None),
            today_image_count: ActiveValue::Set(0),
            today_video_count: ActiveValue::Set(0),
            today_error_count: ActiveValue::Set(0),
            today_date: ActiveValue::Set(None),
            consecutive_error_count: ActiveValue::Set(0),
        };
        let model = active.insert(&self.db).await?;
        Ok(model)
    }
}

fn credential_record(m: entities::credentials::Model) -> CredentialRecord {
    CredentialRecord {
        id: m.id,
        email: m.email,
        access_token: m.access_token,
        session_token: m.session_token,
        refresh_token: m.refresh_token,
        client_id: m.client_id,
        proxy_url: m.proxy_url,
        expiry_time: m.expiry_time,
        enabled: m.enabled,
        expired: m.expired,
        cooled_until: m.cooled_until,
        plan_type: m.plan_type,
        subscription_end: m.subscription_end,
        sora2_supported: m.sora2_supported,
        sora2_remaining_count: m.sora2_remaining_count,
        sora2_cooldown_until: m.sora2_cooldown_until,
        image_enabled: m.image_enabled,
        video_enabled: m.video_enabled,
        image_concurrency: m.image_concurrency,
        video_concurrency: m.video_concurrency,
    }
}

fn task_record(m: entities::tasks::Model) -> StorageResult<TaskRecord> {
    let result_urls = match m.result_urls {
        Some(value) => Some(serde_json::from_value::<Vec<String>>(value)?),
        None => None,
    };
    Ok(TaskRecord {
        task_id: m.task_id,
        credential_id: m.credential_id,
        model: m.model,
        prompt: m.prompt,
        status: m.status,
        progress: m.progress,
        result_urls,
        error_message: m.error_message,
        created_at: m.created_at,
        completed_at: m.completed_at,
    })
}

/// Date stamp the today_* counters are keyed on.
pub fn today_stamp(now: OffsetDateTime) -> String {
    now.date().to_string()
}

/// today_* counters restart from zero when the stamp has rolled over.
fn rolled_today(model: &entities::credential_stats::Model, today: &str) -> (i64, i64, i64) {
    if model.today_date.as_deref() == Some(today) {
        (
            model.today_image_count,
            model.today_video_count,
            model.today_error_count,
        )
    } else {
        (0, 0, 0)
    }
}

fn parse_watermark_method(value: &str) -> WatermarkMethod {
    match value {
        "custom" => WatermarkMethod::Custom,
        _ => WatermarkMethod::ThirdParty,
    }
}

fn watermark_method_str(method: WatermarkMethod) -> &'static str {
    match method {
        WatermarkMethod::ThirdParty => "third_party",
        WatermarkMethod::Custom => "custom",
    }
}

const SINGLETON_ID: i64 = 1;

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Credentials)
            .register(entities::CredentialStats)
            .register(entities::Tasks)
            .register(entities::RequestLogs)
            .register(entities::AdminConfig)
            .register(entities::ProxyConfig)
            .register(entities::WatermarkConfig)
            .register(entities::CacheConfig)
            .register(entities::GenerationConfig)
            .register(entities::RefreshConfig)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn ensure_default_settings(&self, defaults: &GatewaySettings) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();

        if entities::AdminConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::admin_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                admin_username: ActiveValue::Set(defaults.admin.admin_username.clone()),
                admin_password: ActiveValue::Set(defaults.admin.admin_password.clone()),
                api_key: ActiveValue::Set(defaults.admin.api_key.clone()),
                error_ban_threshold: ActiveValue::Set(defaults.admin.error_ban_threshold),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        if entities::ProxyConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::proxy_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                enabled: ActiveValue::Set(defaults.proxy.enabled),
                url: ActiveValue::Set(defaults.proxy.url.clone()),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        if entities::WatermarkConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::watermark_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                enabled: ActiveValue::Set(defaults.watermark.enabled),
                method: ActiveValue::Set(
                    watermark_method_str(defaults.watermark.method).to_string(),
                ),
                custom_url: ActiveValue::Set(defaults.watermark.custom_url.clone()),
                custom_token: ActiveValue::Set(defaults.watermark.custom_token.clone()),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        if entities::CacheConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::cache_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                enabled: ActiveValue::Set(defaults.cache.enabled),
                timeout_secs: ActiveValue::Set(defaults.cache.timeout_secs),
                base_url: ActiveValue::Set(defaults.cache.base_url.clone()),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        if entities::GenerationConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::generation_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                image_timeout_secs: ActiveValue::Set(
                    defaults.generation.image_timeout_secs as i64,
                ),
                video_timeout_secs: ActiveValue::Set(
                    defaults.generation.video_timeout_secs as i64,
                ),
                poll_interval_secs: ActiveValue::Set(
                    defaults.generation.poll_interval_secs as i64,
                ),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        if entities::RefreshConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .is_none()
        {
            entities::refresh_config::ActiveModel {
                id: ActiveValue::Set(SINGLETON_ID),
                auto_refresh_enabled: ActiveValue::Set(defaults.refresh.auto_refresh_enabled),
                updated_at: ActiveValue::Set(now),
            }
            .insert(&self.db)
            .await?;
        }

        Ok(())
    }

    async fn load_settings(&self) -> StorageResult<GatewaySettings> {
        let admin = entities::AdminConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| AdminSettings {
                admin_username: m.admin_username,
                admin_password: m.admin_password,
                api_key: m.api_key,
                error_ban_threshold: m.error_ban_threshold,
            })
            .unwrap_or_default();

        let proxy = entities::ProxyConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| ProxySettings {
                enabled: m.enabled,
                url: m.url,
            })
            .unwrap_or_default();

        let watermark = entities::WatermarkConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| WatermarkSettings {
                enabled: m.enabled,
                method: parse_watermark_method(&m.method),
                custom_url: m.custom_url,
                custom_token: m.custom_token,
            })
            .unwrap_or_default();

        let cache = entities::CacheConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| CacheSettings {
                enabled: m.enabled,
                timeout_secs: m.timeout_secs,
                base_url: m.base_url,
            })
            .unwrap_or_default();

        let generation = entities::GenerationConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| GenerationSettings {
                image_timeout_secs: m.image_timeout_secs.max(0) as u64,
                video_timeout_secs: m.video_timeout_secs.max(0) as u64,
                poll_interval_secs: m.poll_interval_secs.max(1) as u64,
            })
            .unwrap_or_default();

        let refresh = entities::RefreshConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
            .map(|m| RefreshSettings {
                auto_refresh_enabled: m.auto_refresh_enabled,
            })
            .unwrap_or_default();

        Ok(GatewaySettings {
            admin,
            proxy,
            watermark,
            cache,
            generation,
            refresh,
        })
    }

    async fn set_api_key(&self, api_key: &str) -> StorageResult<()> {
        let Some(model) = entities::AdminConfig::find_by_id(SINGLETON_ID)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut active: entities::admin_config::ActiveModel = model.into();
        active.api_key = ActiveValue::Set(api_key.to_string());
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn list_credentials(&self) -> StorageResult<Vec<CredentialRecord>> {
        let rows = entities::Credentials::find().all(&self.db).await?;
        Ok(rows.into_iter().map(credential_record).collect())
    }

    async fn get_credential(
        &self,
        id: CredentialId,
    ) -> StorageResult<Option<CredentialRecord>> {
        let row = entities::Credentials::find_by_id(id).one(&self.db).await?;
        Ok(row.map(credential_record))
    }

    async fn record_credential_use(&self, id: CredentialId) -> StorageResult<()> {
        let Some(model) = entities::Credentials::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let now = OffsetDateTime::now_utc();
        let use_count = model.use_count + 1;
        let mut active: entities::credentials::ActiveModel = model.into();
        active.use_count = ActiveValue::Set(use_count);
        active.last_used_at = ActiveValue::Set(Some(now));
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_credential_expired(&self, id: CredentialId) -> StorageResult<()> {
        let Some(model) = entities::Credentials::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::credentials::ActiveModel = model.into();
        active.expired = ActiveValue::Set(true);
        active.enabled = ActiveValue::Set(false);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_access_token(
        &self,
        id: CredentialId,
        access_token: &str,
        expiry: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        let Some(model) = entities::Credentials::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::credentials::ActiveModel = model.into();
        active.access_token = ActiveValue::Set(access_token.to_string());
        if expiry.is_some() {
            active.expiry_time = ActiveValue::Set(expiry);
        }
        active.expired = ActiveValue::Set(false);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_sora2_remaining(&self, id: CredentialId, remaining: i32) -> StorageResult<()> {
        let Some(model) = entities::Credentials::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::credentials::ActiveModel = model.into();
        active.sora2_remaining_count = ActiveValue::Set(remaining.max(0));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_sora2_cooldown(
        &self,
        id: CredentialId,
        until: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        let Some(model) = entities::Credentials::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::credentials::ActiveModel = model.into();
        active.sora2_cooldown_until = ActiveValue::Set(until);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn get_stats(&self, id: CredentialId) -> StorageResult<Option<StatsRecord>> {
        use entities::credential_stats::Column;
        let row = entities::CredentialStats::find()
            .filter(Column::CredentialId.eq(id))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| StatsRecord {
            credential_id: m.credential_id,
            image_count: m.image_count,
            video_count: m.video_count,
            error_count: m.error_count,
            today_image_count: m.today_image_count,
            today_video_count: m.today_video_count,
            today_error_count: m.today_error_count,
            today_date: m.today_date,
            consecutive_error_count: m.consecutive_error_count,
            last_error_at: m.last_error_at,
        }))
    }

    async fn record_success(&self, id: CredentialId, video: bool) -> StorageResult<()> {
        let model = self.ensure_stats_row(id).await?;
        let today = today_stamp(OffsetDateTime::now_utc());
        let (today_image, today_video, today_error) = rolled_today(&model, &today);

        let image_count = model.image_count + i64::from(!video);
        let video_count = model.video_count + i64::from(video);
        let mut active: entities::credential_stats::ActiveModel = model.into();
        active.image_count = ActiveValue::Set(image_count);
        active.video_count = ActiveValue::Set(video_count);
        active.today_image_count = ActiveValue::Set(today_image + i64::from(!video));
        active.today_video_count = ActiveValue::Set(today_video + i64::from(video));
        active.today_error_count = ActiveValue::Set(today_error);
        active.today_date = ActiveValue::Set(Some(today));
        active.consecutive_error_count = ActiveValue::Set(0);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn record_error(
        &self,
        id: CredentialId,
        count_consecutive: bool,
        ban_threshold: i32,
    ) -> StorageResult<()> {
        let model = self.ensure_stats_row(id).await?;
        let now = OffsetDateTime::now_utc();
        let today = today_stamp(now);
        let (today_image, today_video, today_error) = rolled_today(&model, &today);

        let error_count = model.error_count + 1;
        let consecutive = if count_consecutive {
            model.consecutive_error_count + 1
        } else {
            model.consecutive_error_count
        };

        let mut active: entities::credential_stats::ActiveModel = model.into();
        active.error_count = ActiveValue::Set(error_count);
        active.last_error_at = ActiveValue::Set(Some(now));
        active.today_image_count = ActiveValue::Set(today_image);
        active.today_video_count = ActiveValue::Set(today_video);
        active.today_error_count = ActiveValue::Set(today_error + 1);
        active.today_date = ActiveValue::Set(Some(today));
        active.consecutive_error_count = ActiveValue::Set(consecutive);
        active.update(&self.db).await?;

        // Auto-ban actuator: disable the credential once the consecutive
        // threshold is reached. Lifetime counters are never reset here.
        if ban_threshold > 0 && consecutive >= ban_threshold {
            if let Some(cred) = entities::Credentials::find_by_id(id).one(&self.db).await? {
                let mut active: entities::credentials::ActiveModel = cred.into();
                active.enabled = ActiveValue::Set(false);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn insert_task(&self, task: NewTask) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::tasks::ActiveModel {
            id: ActiveValue::NotSet,
            task_id: ActiveValue::Set(task.task_id),
            credential_id: ActiveValue::Set(task.credential_id),
            model: ActiveValue::Set(task.model),
            prompt: ActiveValue::Set(task.prompt),
            status: ActiveValue::Set(TaskStatus::Processing.as_str().to_string()),
            progress: ActiveValue::Set(0.0),
            result_urls: ActiveValue::Set(None),
            error_message: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            completed_at: ActiveValue::Set(None),
        };
        let inserted = entities::Tasks::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: f64,
        result_urls: Option<&[String]>,
        error_message: Option<&str>,
    ) -> StorageResult<()> {
        use entities::tasks::Column;
        let Some(model) = entities::Tasks::find()
            .filter(Column::TaskId.eq(task_id))
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };

        let terminal = !matches!(status, TaskStatus::Processing);
        let mut active: entities::tasks::ActiveModel = model.into();
        active.status = ActiveValue::Set(status.as_str().to_string());
        active.progress = ActiveValue::Set(progress);
        if let Some(urls) = result_urls {
            active.result_urls = ActiveValue::Set(Some(serde_json::to_value(urls)?));
        }
        if let Some(message) = error_message {
            active.error_message = ActiveValue::Set(Some(message.to_string()));
        }
        if terminal {
            active.completed_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
        }
        active.update(&self.db).await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>> {
        use entities::tasks::Column;
        let row = entities::Tasks::find()
            .filter(Column::TaskId.eq(task_id))
            .one(&self.db)
            .await?;
        row.map(task_record).transpose()
    }

    async fn open_request_log(&self, log: NewRequestLog) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::request_logs::ActiveModel {
            id: ActiveValue::NotSet,
            credential_id: ActiveValue::Set(log.credential_id),
            task_id: ActiveValue::Set(log.task_id),
            operation: ActiveValue::Set(log.operation),
            request_body: ActiveValue::Set(Some(log.request_body)),
            response_body: ActiveValue::Set(None),
            status_code: ActiveValue::Set(-1),
            duration: ActiveValue::Set(-1.0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn close_request_log(
        &self,
        log_id: i64,
        response_body: &str,
        status_code: i32,
        duration_secs: f64,
    ) -> StorageResult<()> {
        let Some(model) = entities::RequestLogs::find_by_id(log_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::request_logs::ActiveModel = model.into();
        active.response_body = ActiveValue::Set(Some(response_body.to_string()));
        active.status_code = ActiveValue::Set(status_code);
        active.duration = ActiveValue::Set(duration_secs);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn stats(today_date: Option<&str>) -> entities::credential_stats::Model {
        entities::credential_stats::Model {
            id: 1,
            credential_id: 7,
            image_count: 10,
            video_count: 4,
            error_count: 2,
            last_error_at: None,
            today_image_count: 3,
            today_video_count: 1,
            today_error_count: 1,
            today_date: today_date.map(str::to_string),
            consecutive_error_count: 1,
        }
    }

    #[test]
    fn today_counters_keep_running_within_the_day() {
        let model = stats(Some("2026-08-01"));
        assert_eq!(rolled_today(&model, "2026-08-01"), (3, 1, 1));
    }

    #[test]
    fn today_counters_roll_on_new_stamp() {
        let model = stats(Some("2026-07-31"));
        assert_eq!(rolled_today(&model, "2026-08-01"), (0, 0, 0));
    }

    #[test]
    fn stamp_is_iso_date() {
        let now = datetime!(2026-08-01 10:30 UTC);
        assert_eq!(today_stamp(now), "2026-08-01");
    }
}

use std::sync::atomic::{AtomicU32, Ordering};

use sea_orm::{ActiveModelTrait, ActiveValue};
use time::OffsetDateTime;

use sproxy_common::GatewaySettings;
use sproxy_storage::entities;
use sproxy_storage::{NewRequestLog, NewTask, SeaOrmStorage, Storage, TaskStatus};

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

async fn fresh_storage() -> SeaOrmStorage {
    let path = std::env::temp_dir().join(format!(
        "sproxy-storage-test-{}-{}.db",
        std::process::id(),
        DB_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_file(&path);
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let storage = SeaOrmStorage::connect(&dsn).await.unwrap();
    storage.sync().await.unwrap();
    storage
}

async fn insert_credential(storage: &SeaOrmStorage, email: &str) -> i64 {
    let now = OffsetDateTime::now_utc();
    let active = entities::credentials::ActiveModel {
        id: ActiveValue::NotSet,
        email: ActiveValue::Set(email.to_string()),
        access_token: ActiveValue::Set("at".to_string()),
        session_token: ActiveValue::Set(None),
        refresh_token: ActiveValue::Set(None),
        client_id: ActiveValue::Set(None),
        proxy_url: ActiveValue::Set(None),
        remark: ActiveValue::Set(None),
        expiry_time: ActiveValue::Set(None),
        enabled: ActiveValue::Set(true),
        expired: ActiveValue::Set(false),
        cooled_until: ActiveValue::Set(None),
        plan_type: ActiveValue::Set(None),
        plan_title: ActiveValue::Set(None),
        subscription_end: ActiveValue::Set(None),
        sora2_supported: ActiveValue::Set(true),
        sora2_remaining_count: ActiveValue::Set(10),
        sora2_cooldown_until: ActiveValue::Set(None),
        image_enabled: ActiveValue::Set(true),
        video_enabled: ActiveValue::Set(true),
        image_concurrency: ActiveValue::Set(-1),
        video_concurrency: ActiveValue::Set(-1),
        use_count: ActiveValue::Set(0),
        last_used_at: ActiveValue::Set(None),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
    };
    let model = active.insert(storage.connection()).await.unwrap();
    model.id
}

#[tokio::test]
async fn default_settings_seed_once_and_load_back() {
    let storage = fresh_storage().await;
    let defaults = GatewaySettings::default();
    storage.ensure_default_settings(&defaults).await.unwrap();
    // Second call must not clobber existing rows.
    storage.ensure_default_settings(&defaults).await.unwrap();

    let settings = storage.load_settings().await.unwrap();
    assert_eq!(settings.admin.error_ban_threshold, 3);
    assert_eq!(settings.generation.image_timeout_secs, 300);
    assert_eq!(settings.generation.video_timeout_secs, 1200);
    assert_eq!(settings.cache.timeout_secs, 7200);
    assert!(settings.cache.enabled);
    assert!(!settings.watermark.enabled);

    storage.set_api_key("sk-test-key").await.unwrap();
    let settings = storage.load_settings().await.unwrap();
    assert_eq!(settings.admin.api_key, "sk-test-key");
}

#[tokio::test]
async fn consecutive_errors_trip_the_ban_threshold() {
    let storage = fresh_storage().await;
    let id = insert_credential(&storage, "ban@example.com").await;

    storage.record_error(id, true, 3).await.unwrap();
    storage.record_error(id, true, 3).await.unwrap();
    let cred = storage.get_credential(id).await.unwrap().unwrap();
    assert!(cred.enabled, "below the threshold the credential stays on");

    storage.record_error(id, true, 3).await.unwrap();
    let cred = storage.get_credential(id).await.unwrap().unwrap();
    assert!(!cred.enabled, "third consecutive error disables");

    let stats = storage.get_stats(id).await.unwrap().unwrap();
    assert_eq!(stats.error_count, 3);
    assert_eq!(stats.consecutive_error_count, 3);
}

#[tokio::test]
async fn overload_errors_never_advance_the_consecutive_counter() {
    let storage = fresh_storage().await;
    let id = insert_credential(&storage, "overload@example.com").await;

    for _ in 0..5 {
        storage.record_error(id, false, 3).await.unwrap();
    }
    let cred = storage.get_credential(id).await.unwrap().unwrap();
    assert!(cred.enabled);
    let stats = storage.get_stats(id).await.unwrap().unwrap();
    assert_eq!(stats.error_count, 5);
    assert_eq!(stats.consecutive_error_count, 0);
}

#[tokio::test]
async fn success_resets_consecutive_but_not_lifetime_errors() {
    let storage = fresh_storage().await;
    let id = insert_credential(&storage, "reset@example.com").await;

    storage.record_error(id, true, 10).await.unwrap();
    storage.record_error(id, true, 10).await.unwrap();
    storage.record_success(id, true).await.unwrap();

    let stats = storage.get_stats(id).await.unwrap().unwrap();
    assert_eq!(stats.consecutive_error_count, 0);
    assert_eq!(stats.error_count, 2);
    assert_eq!(stats.video_count, 1);
    assert_eq!(stats.today_video_count, 1);

    storage.record_success(id, false).await.unwrap();
    let stats = storage.get_stats(id).await.unwrap().unwrap();
    assert_eq!(stats.image_count, 1);
    assert_eq!(stats.today_image_count, 1);
}

#[tokio::test]
async fn task_lifecycle_holds_terminal_invariants() {
    let storage = fresh_storage().await;
    let cred_id = insert_credential(&storage, "task@example.com").await;

    storage
        .insert_task(NewTask {
            task_id: "task_abc".to_string(),
            credential_id: cred_id,
            model: "sora2-landscape-10s".to_string(),
            prompt: "a quiet harbor".to_string(),
        })
        .await
        .unwrap();

    let task = storage.get_task("task_abc").await.unwrap().unwrap();
    assert_eq!(task.status, "processing");
    assert!(task.result_urls.is_none());
    assert!(task.completed_at.is_none());

    let urls = vec!["http://host/tmp/abc.mp4".to_string()];
    storage
        .update_task("task_abc", TaskStatus::Completed, 100.0, Some(&urls), None)
        .await
        .unwrap();
    let task = storage.get_task("task_abc").await.unwrap().unwrap();
    assert_eq!(task.status, "completed");
    assert_eq!(task.result_urls.as_deref(), Some(urls.as_slice()));
    assert!(task.error_message.is_none());
    assert!(task.completed_at.is_some());

    storage
        .insert_task(NewTask {
            task_id: "task_bad".to_string(),
            credential_id: cred_id,
            model: "gpt-image".to_string(),
            prompt: "x".to_string(),
        })
        .await
        .unwrap();
    storage
        .update_task("task_bad", TaskStatus::Failed, 0.0, None, Some("boom"))
        .await
        .unwrap();
    let task = storage.get_task("task_bad").await.unwrap().unwrap();
    assert_eq!(task.status, "failed");
    assert!(task.result_urls.is_none());
    assert_eq!(task.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn request_logs_open_with_sentinels_and_close_once() {
    let storage = fresh_storage().await;
    let cred_id = insert_credential(&storage, "log@example.com").await;

    let log_id = storage
        .open_request_log(NewRequestLog {
            credential_id: Some(cred_id),
            task_id: Some("task_xyz".to_string()),
            operation: "generate_video".to_string(),
            request_body: "{}".to_string(),
        })
        .await
        .unwrap();

    use sea_orm::EntityTrait;
    let row = entities::RequestLogs::find_by_id(log_id)
        .one(storage.connection())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status_code, -1);
    assert_eq!(row.duration, -1.0);

    storage
        .close_request_log(log_id, "{\"ok\":true}", 200, 12.5)
        .await
        .unwrap();
    let row = entities::RequestLogs::find_by_id(log_id)
        .one(storage.connection())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status_code, 200);
    assert_eq!(row.duration, 12.5);
    assert_eq!(row.response_body.as_deref(), Some("{\"ok\":true}"));
}

#[tokio::test]
async fn expiry_and_usage_bookkeeping() {
    let storage = fresh_storage().await;
    let id = insert_credential(&storage, "use@example.com").await;

    storage.record_credential_use(id).await.unwrap();
    storage.record_credential_use(id).await.unwrap();
    storage.mark_credential_expired(id).await.unwrap();

    let cred = storage.get_credential(id).await.unwrap().unwrap();
    assert!(cred.expired);
    assert!(!cred.enabled);
    assert!(!cred.is_active(OffsetDateTime::now_utc()));
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sea_orm::{ActiveModelTrait, ActiveValue};
use time::OffsetDateTime;

use sproxy_common::GatewaySettings;
use sproxy_core::{AppState, FileCache, availability_message, find_model};
use sproxy_storage::entities;
use sproxy_storage::{SeaOrmStorage, Storage};
use sproxy_upstream::SoraClient;

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

async fn app_state() -> (Arc<AppState>, SeaOrmStorage) {
    let path = std::env::temp_dir().join(format!(
        "sproxy-core-test-{}-{}.db",
        std::process::id(),
        DB_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_file(&path);
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let storage = SeaOrmStorage::connect(&dsn).await.unwrap();
    storage.sync().await.unwrap();
    storage
        .ensure_default_settings(&GatewaySettings::default())
        .await
        .unwrap();
    let settings = storage.load_settings().await.unwrap();

    let cache_dir =
        std::env::temp_dir().join(format!("sproxy-core-test-cache-{}", DB_SEQ.load(Ordering::Relaxed)));
    let state = AppState::new(
        Arc::new(storage.clone()),
        Arc::new(SoraClient::new(None, Duration::from_secs(5))),
        Arc::new(FileCache::new(cache_dir).unwrap()),
        settings,
        "127.0.0.1:8000".to_string(),
    );
    (Arc::new(state), storage)
}

async fn insert_credential(storage: &SeaOrmStorage, email: &str, video_enabled: bool) -> i64 {
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
        expiry_time: ActiveValue::Set(Some(now + time::Duration::days(7))),
        enabled: ActiveValue::Set(true),
        expired: ActiveValue::Set(false),
        cooled_until: ActiveValue::Set(None),
        plan_type: ActiveValue::Set(None),
        plan_title: ActiveValue::Set(None),
        subscription_end: ActiveValue::Set(None),
        sora2_supported: ActiveValue::Set(true),
        sora2_remaining_count: ActiveValue::Set(5),
        sora2_cooldown_until: ActiveValue::Set(None),
        image_enabled: ActiveValue::Set(true),
        video_enabled: ActiveValue::Set(video_enabled),
        image_concurrency: ActiveValue::Set(-1),
        video_concurrency: ActiveValue::Set(-1),
        use_count: ActiveValue::Set(0),
        last_used_at: ActiveValue::Set(None),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
    };
    active.insert(storage.connection()).await.unwrap().id
}

#[tokio::test]
async fn empty_pool_reports_no_models() {
    let (state, _storage) = app_state().await;
    let spec = find_model("gpt-image").unwrap();
    let message = availability_message(&state, spec).await.unwrap();
    assert_eq!(message, "No available models for image generation");
}

#[tokio::test]
async fn active_credential_reports_availability() {
    let (state, storage) = app_state().await;
    insert_credential(&storage, "avail@example.com", true).await;

    let spec = find_model("gpt-image").unwrap();
    let message = availability_message(&state, spec).await.unwrap();
    assert!(message.starts_with("All credentials available for image generation"));

    let spec = find_model("sora2-landscape-10s").unwrap();
    let message = availability_message(&state, spec).await.unwrap();
    assert!(message.starts_with("All credentials available for video generation"));
}

#[tokio::test]
async fn feature_flags_gate_the_modality() {
    let (state, storage) = app_state().await;
    insert_credential(&storage, "novideo@example.com", false).await;

    let spec = find_model("sora2-portrait-15s").unwrap();
    let message = availability_message(&state, spec).await.unwrap();
    assert_eq!(message, "No available models for video generation");

    // The same pool still serves images.
    let spec = find_model("gpt-image").unwrap();
    let message = availability_message(&state, spec).await.unwrap();
    assert!(message.starts_with("All credentials available"));
}

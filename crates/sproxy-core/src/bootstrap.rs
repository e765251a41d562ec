use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use sproxy_common::GatewaySettings;
use sproxy_storage::{SeaOrmStorage, Storage};
use sproxy_upstream::SoraClient;

use crate::cache::FileCache;
use crate::state::AppState;
use crate::workers;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);
const CACHE_DIR: &str = "tmp";

#[derive(Debug, Clone, Parser)]
#[command(name = "sproxy", version, about = "High-performance Sora media gateway")]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "SPROXY_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "SPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "SPROXY_PORT")]
    pub port: Option<String>,

    /// Caller API key. Overwrites the stored admin config value.
    #[arg(long, env = "SPROXY_API_KEY")]
    pub api_key: Option<String>,

    /// Upstream base URL override (primarily for tests).
    #[arg(long, env = "SPROXY_UPSTREAM_BASE")]
    pub upstream_base: Option<String>,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
    pub host: String,
    pub port: u16,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let host = sanitize_optional_env_value(args.host.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = parse_u16_env_value(args.port.clone(), "SPROXY_PORT")?.unwrap_or(8000);
    let api_key = sanitize_optional_env_value(args.api_key.clone());
    let upstream_base = sanitize_optional_env_value(args.upstream_base.clone());

    ensure_sqlite_parent_dir(&dsn)?;

    // 1) connect DB from CLI/ENV DSN and sync the entity schema.
    let storage = Arc::new(
        SeaOrmStorage::connect(&dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // 2) seed missing config rows with defaults, then fold in CLI overrides.
    storage
        .ensure_default_settings(&GatewaySettings::default())
        .await
        .context("seed default settings")?;
    let mut settings = storage.load_settings().await.context("load settings")?;

    if let Some(api_key) = api_key {
        storage
            .set_api_key(&api_key)
            .await
            .context("store api key")?;
        settings.admin.api_key = api_key;
    } else if settings.admin.api_key.is_empty() {
        let generated = uuid::Uuid::new_v4().to_string();
        eprintln!("generated api key: {generated}");
        storage
            .set_api_key(&generated)
            .await
            .context("store generated api key")?;
        settings.admin.api_key = generated;
    }

    // 3) build in-memory runtime state; process-local counters reset here.
    let client = Arc::new(SoraClient::new(upstream_base, UPSTREAM_TIMEOUT));
    let cache = Arc::new(FileCache::new(CACHE_DIR).context("create cache dir")?);
    let public_address = format!("{host}:{port}");
    let storage_iface: Arc<dyn Storage> = storage.clone();
    let state = Arc::new(AppState::new(
        storage_iface,
        client,
        cache,
        settings,
        public_address,
    ));

    // Seed the limiter from every credential's stored ceilings.
    let credentials = storage
        .list_credentials()
        .await
        .context("load credentials")?;
    state.limiter.seed(&credentials);

    workers::spawn_cache_eviction(state.clone());
    workers::spawn_token_refresh(state.clone());

    Ok(Bootstrap { state, host, port })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    // Treat them as "not set" so startup doesn't fail on URL parsing.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("SPROXY_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/sproxy.db?mode=rwc");
    }
    "sqlite://sproxy.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }

    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }

    let memory = normalized.to_ascii_lowercase();
    if memory == ":memory:" {
        return None;
    }

    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::{parse_u16_env_value, sanitize_optional_env_value, sqlite_file_path_from_dsn};

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://sproxy.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "sproxy.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }

    #[test]
    fn placeholder_env_values_are_dropped() {
        assert_eq!(sanitize_optional_env_value(Some("${PORT}".to_string())), None);
        assert_eq!(sanitize_optional_env_value(Some("  ".to_string())), None);
        assert_eq!(
            sanitize_optional_env_value(Some(" 8000 ".to_string())).as_deref(),
            Some("8000")
        );
    }

    #[test]
    fn port_parsing_rejects_garbage() {
        assert!(parse_u16_env_value(Some("eighty".to_string()), "SPROXY_PORT").is_err());
        assert_eq!(
            parse_u16_env_value(Some("8000".to_string()), "SPROXY_PORT").unwrap(),
            Some(8000)
        );
    }
}

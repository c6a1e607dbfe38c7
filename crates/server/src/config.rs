use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use realtime::config::RealtimeConfig;
use serde::Deserialize;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Unset means single-node mode over the in-process store.
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub instance_id: Option<String>,
    pub connection_budget: Option<usize>,
    pub ring_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            redis_url: None,
            jwt_secret: DEV_JWT_SECRET.into(),
            instance_id: None,
            connection_budget: None,
            ring_timeout_secs: None,
        }
    }
}

impl Settings {
    pub fn realtime_config(&self) -> RealtimeConfig {
        let mut config = RealtimeConfig::default();
        if let Some(budget) = self.connection_budget {
            config.connection_budget = budget;
        }
        if let Some(secs) = self.ring_timeout_secs {
            config.ring_timeout = Duration::from_secs(secs);
        }
        config
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `server.toml` table, then environment. `APP__*`
/// aliases win over the plain names.
pub(crate) fn settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("redis_url") {
                settings.redis_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("jwt_secret") {
                settings.jwt_secret = v.clone();
            }
            if let Some(v) = file_cfg.get("instance_id") {
                settings.instance_id = Some(v.clone());
            }
        }
    }

    let lookup = |plain: &str, alias: &str| env(alias).or_else(|| env(plain));

    if let Some(v) = lookup("SERVER_BIND", "APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("DATABASE_URL", "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("REDIS_URL", "APP__REDIS_URL") {
        settings.redis_url = Some(v).filter(|url| !url.trim().is_empty());
    }
    if let Some(v) = lookup("JWT_SECRET", "APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Some(v) = lookup("INSTANCE_ID", "APP__INSTANCE_ID") {
        settings.instance_id = Some(v);
    }
    if let Some(v) = env("APP__CONNECTION_BUDGET") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.connection_budget = Some(parsed);
        }
    }
    if let Some(v) = env("APP__RING_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.ring_timeout_secs = Some(parsed);
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

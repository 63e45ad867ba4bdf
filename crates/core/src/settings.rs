use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_workers() -> usize {
    4
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_dead_worker_secs() -> u64 {
    30
}

fn default_max_requeues() -> u32 {
    3
}

/// Operator defaults, loaded from `$XDG_CONFIG_HOME/jobq/config.json`.
/// CLI flags and environment variables override these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_dead_worker_secs")]
    pub dead_worker_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            dead_worker_timeout_secs: default_dead_worker_secs(),
            job_timeout_secs: None,
            max_requeues: default_max_requeues(),
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Location of the settings file.
pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("jobq").join("config.json"))
}

fn load_from(path: &Path) -> anyhow::Result<Option<QueueSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

fn save_to(path: &Path, settings: &QueueSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the settings file, if present.
pub fn load_settings() -> anyhow::Result<Option<QueueSettings>> {
    load_from(&settings_path()?)
}

/// Persist settings atomically (write-then-rename).
pub fn save_settings(settings: &QueueSettings) -> anyhow::Result<()> {
    save_to(&settings_path()?, settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_file() {
        let dir = std::env::temp_dir().join(format!("jobq-settings-{}", std::process::id()));
        let path = dir.join("config.json");

        let settings = QueueSettings {
            workers: 2,
            heartbeat_interval_secs: 1,
            dead_worker_timeout_secs: 6,
            job_timeout_secs: Some(120),
            max_requeues: 5,
        };
        save_to(&path, &settings).unwrap();
        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded, settings);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("jobq-settings-does-not-exist.json");
        assert!(load_from(&path).unwrap().is_none());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let settings: QueueSettings = serde_json::from_str(r#"{"workers": 8}"#).unwrap();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.heartbeat_interval_secs, 5);
        assert_eq!(settings.dead_worker_timeout_secs, 30);
        assert_eq!(settings.job_timeout_secs, None);
        assert_eq!(settings.max_requeues, 3);
    }
}

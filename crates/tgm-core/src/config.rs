use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{archive::ArchiveFormat, errors::Error, Result};

pub const DEFAULT_SESSIONS_DIR: &str = "sessions";
pub const DEFAULT_ARCHIVE_AGE_DAYS: u32 = 30;
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;
pub const DEFAULT_INTERRUPTED_MAX_AGE_HOURS: u32 = 24;
pub const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 50;
pub const DEFAULT_AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Typed configuration for the session tool.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub sessions_dir: PathBuf,
    pub max_history_size: usize,
    pub max_active_sessions: usize,
    pub auto_save_interval: Duration,

    // Archiving
    pub archive_dir: PathBuf,
    pub archive_age_days: u32,
    pub archive_format: ArchiveFormat,

    // Recovery
    pub interrupted_max_age_hours: u32,
    pub recovery_session_types: Vec<String>,

    // Maintenance loop
    pub maintenance_interval: Duration,
    pub maintenance_retry: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let sessions_dir = env_path("TGM_SESSIONS_DIR")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSIONS_DIR));
        let max_history_size =
            env_usize("TGM_MAX_HISTORY_SIZE").unwrap_or(DEFAULT_MAX_HISTORY_SIZE);
        let max_active_sessions =
            env_usize("TGM_MAX_ACTIVE_SESSIONS").unwrap_or(DEFAULT_MAX_ACTIVE_SESSIONS);
        let auto_save_interval = env_u64("TGM_AUTO_SAVE_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_AUTO_SAVE_INTERVAL);

        // Archive dir defaults to a subdirectory of the sessions dir.
        let archive_dir =
            env_path("TGM_ARCHIVE_DIR").unwrap_or_else(|| sessions_dir.join("archives"));
        let archive_age_days =
            env_u32("TGM_ARCHIVE_AGE_DAYS").unwrap_or(DEFAULT_ARCHIVE_AGE_DAYS);
        let archive_format = match env_str("TGM_ARCHIVE_FORMAT").and_then(non_empty) {
            Some(raw) => raw
                .parse::<ArchiveFormat>()
                .map_err(|e| Error::Config(format!("TGM_ARCHIVE_FORMAT: {e}")))?,
            None => ArchiveFormat::Zip,
        };

        let interrupted_max_age_hours = env_u32("TGM_INTERRUPTED_MAX_AGE_HOURS")
            .unwrap_or(DEFAULT_INTERRUPTED_MAX_AGE_HOURS);
        let recovery_session_types = parse_csv(env_str("TGM_RECOVERY_SESSION_TYPES"));

        let maintenance_interval =
            Duration::from_secs(env_u64("TGM_MAINTENANCE_INTERVAL_SECS").unwrap_or(86_400));
        let maintenance_retry =
            Duration::from_secs(env_u64("TGM_MAINTENANCE_RETRY_SECS").unwrap_or(3_600));

        fs::create_dir_all(&sessions_dir)?;

        Ok(Self {
            sessions_dir,
            max_history_size,
            max_active_sessions,
            auto_save_interval,
            archive_dir,
            archive_age_days,
            archive_format,
            interrupted_max_age_hours,
            recovery_session_types,
            maintenance_interval,
            maintenance_retry,
        })
    }

    /// Defaults rooted at `sessions_dir`, ignoring the environment.
    pub fn for_sessions_dir(sessions_dir: impl Into<PathBuf>) -> Self {
        let sessions_dir = sessions_dir.into();
        Self {
            archive_dir: sessions_dir.join("archives"),
            sessions_dir,
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
            max_active_sessions: DEFAULT_MAX_ACTIVE_SESSIONS,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
            archive_age_days: DEFAULT_ARCHIVE_AGE_DAYS,
            archive_format: ArchiveFormat::Zip,
            interrupted_max_age_hours: DEFAULT_INTERRUPTED_MAX_AGE_HOURS,
            recovery_session_types: Vec::new(),
            maintenance_interval: Duration::from_secs(86_400),
            maintenance_retry: Duration::from_secs(3_600),
        }
    }

    /// Session type filter for interrupted-session scans (`None` = all types).
    pub fn session_type_filter(&self) -> Option<&[String]> {
        if self.recovery_session_types.is_empty() {
            None
        } else {
            Some(&self.recovery_session_types)
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

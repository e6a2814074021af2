use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ConfigError, TimerError};
use crate::models::SessionKind;
use crate::rules;

pub const FOCUS_MINUTES: (u32, u32) = (1, 120);
pub const SHORT_BREAK_MINUTES: (u32, u32) = (1, 30);
pub const LONG_BREAK_MINUTES: (u32, u32) = (1, 60);
pub const LONG_BREAK_INTERVAL: (u32, u32) = (2, 10);

/// 计时配置（每次开始会话时读取一次快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub focus_minutes: u32,
    pub short_break_minutes: u32,
    pub long_break_minutes: u32,
    /// 每 N 个专注后进入长休息
    pub long_break_interval: u32,
    pub auto_start_breaks: bool,
    pub auto_start_focus: bool,
    pub notifications: bool,
    pub sound: bool,
    pub vibration: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            focus_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            long_break_interval: 4,
            auto_start_breaks: false,
            auto_start_focus: false,
            notifications: true,
            sound: true,
            vibration: true,
        }
    }
}

impl Config {
    /// 某种会话的计划时长（毫秒）
    pub fn duration_ms(&self, kind: SessionKind) -> i64 {
        let minutes = match kind {
            SessionKind::Focus => self.focus_minutes,
            SessionKind::ShortBreak => self.short_break_minutes,
            SessionKind::LongBreak => self.long_break_minutes,
        };
        i64::from(minutes) * 60_000
    }

    pub fn validate(&self) -> Result<(), TimerError> {
        for kind in [SessionKind::Focus, SessionKind::ShortBreak, SessionKind::LongBreak] {
            rules::validate_duration(self.duration_ms(kind))?;
        }
        check("focus_minutes", self.focus_minutes, FOCUS_MINUTES)?;
        check("short_break_minutes", self.short_break_minutes, SHORT_BREAK_MINUTES)?;
        check("long_break_minutes", self.long_break_minutes, LONG_BREAK_MINUTES)?;
        check("long_break_interval", self.long_break_interval, LONG_BREAK_INTERVAL)
    }

    /// 从 TOML 文件加载，缺失的键使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TimerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TimerError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).map_err(ConfigError::from)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn check(key: &'static str, value: u32, (min, max): (u32, u32)) -> Result<(), TimerError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        }
        .into());
    }
    Ok(())
}

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "focus-timer", "focus")
}

/// 默认配置文件路径
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// 默认数据库路径
pub fn default_db_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("focus.db"))
}

/// 配置来源
pub trait ConfigProvider: Send + Sync {
    fn get(&self) -> Config;
}

impl ConfigProvider for Config {
    fn get(&self) -> Config {
        self.clone()
    }
}

/// 每次读取都重新加载文件，失败时沿用上一次有效的配置
pub struct ConfigFile {
    path: PathBuf,
    last_good: Mutex<Config>,
}

impl ConfigFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Mutex::new(Config::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for ConfigFile {
    fn get(&self) -> Config {
        let mut last_good = match self.last_good.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.path.exists() {
            return last_good.clone();
        }
        match Config::load(&self.path) {
            Ok(config) => {
                *last_good = config.clone();
                config
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "keeping previous configuration");
                last_good.clone()
            }
        }
    }
}

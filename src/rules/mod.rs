// 会话规则：纯函数，不依赖任何状态

use crate::config::Config;
use crate::error::TimerError;
use crate::models::SessionKind;

/// 单个会话允许的最长时长
pub const MAX_DURATION_MS: i64 = 2 * 60 * 60 * 1000;

/// 专注完成后的下一个会话类型
pub fn next_session_kind(completed_focus: u32, config: &Config) -> SessionKind {
    let interval = config.long_break_interval.max(1);
    if completed_focus > 0 && completed_focus % interval == 0 {
        SessionKind::LongBreak
    } else {
        SessionKind::ShortBreak
    }
}

/// 是否自动开始该类型的会话
pub fn should_auto_start(kind: SessionKind, config: &Config) -> bool {
    match kind {
        SessionKind::Focus => config.auto_start_focus,
        SessionKind::ShortBreak | SessionKind::LongBreak => config.auto_start_breaks,
    }
}

pub fn validate_duration(ms: i64) -> Result<(), TimerError> {
    if ms <= 0 || ms > MAX_DURATION_MS {
        return Err(TimerError::InvalidDuration { ms });
    }
    Ok(())
}

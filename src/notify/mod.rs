use anyhow::Result;
use notify_rust::{Notification, Timeout};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::ConfigProvider;
use crate::models::SessionKind;
use crate::pomodoro::EngineEvent;

/// 通知管理器
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationManager;

impl NotificationManager {
    pub fn new() -> Self {
        Self
    }

    /// 会话完成通知
    pub fn send_session_complete(&self, finished: SessionKind, next: SessionKind) -> Result<()> {
        let (summary, body) = completion_message(finished, next);
        Notification::new()
            .summary(&format!("🍅 {}", summary))
            .body(&body)
            .icon("emblem-default")
            .timeout(Timeout::Milliseconds(5000))
            .show()?;
        Ok(())
    }

    /// 发送普通通知
    pub fn send_notification(&self, title: &str, body: &str) -> Result<()> {
        Notification::new()
            .summary(title)
            .body(body)
            .timeout(Timeout::Milliseconds(3000))
            .show()?;
        Ok(())
    }
}

fn completion_message(finished: SessionKind, next: SessionKind) -> (&'static str, String) {
    let summary = match finished {
        SessionKind::Focus => "Focus session complete",
        SessionKind::ShortBreak | SessionKind::LongBreak => "Break is over",
    };
    let body = match next {
        SessionKind::Focus => "Ready for the next focus session.".to_string(),
        SessionKind::ShortBreak => "Take a short break.".to_string(),
        SessionKind::LongBreak => "You earned a long break.".to_string(),
    };
    (summary, body)
}

/// 订阅引擎事件，会话完成时弹出桌面通知
pub async fn watch_completions(
    mut events: broadcast::Receiver<EngineEvent>,
    config: Arc<dyn ConfigProvider>,
) {
    let notifier = NotificationManager::new();
    loop {
        match events.recv().await {
            Ok(EngineEvent::SessionCompleted { session, next_kind }) => {
                if !config.get().notifications {
                    continue;
                }
                let kind = session.kind;
                // D-Bus 调用是阻塞的
                let shown = tokio::task::spawn_blocking(move || {
                    notifier.send_session_complete(kind, next_kind)
                })
                .await;
                match shown {
                    Ok(Err(e)) => tracing::error!("Failed to send notification: {}", e),
                    Err(e) => tracing::error!("Notification task panicked: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            Ok(EngineEvent::PersistenceFailed { message, .. }) => {
                if !config.get().notifications {
                    continue;
                }
                let body = format!("Retrying on the next tick: {message}");
                let shown = tokio::task::spawn_blocking(move || {
                    notifier.send_notification("Session not saved", &body)
                })
                .await;
                if let Ok(Err(e)) = shown {
                    tracing::error!("Failed to send notification: {}", e);
                }
            }
            Ok(EngineEvent::SideEffectFailed { step, message, .. }) => {
                tracing::warn!("{} update failed after completion: {}", step, message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("notification watcher skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

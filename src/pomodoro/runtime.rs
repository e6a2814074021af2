// 引擎的单写者运行时：命令和 tick 由同一个任务逐个处理

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{EngineEvent, TickOutcome, TimerEngine, TimerSnapshot};
use crate::clock::TickReceiver;
use crate::error::TimerError;
use crate::models::SessionKind;

const REQUEST_QUEUE: usize = 64;

/// 外部命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(SessionKind),
    Pause,
    Resume,
    Reset,
    Interrupt,
    SetNote(String),
    Status,
    Shutdown,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<TimerSnapshot, TimerError>>,
}

/// 引擎句柄，可以克隆并在多个任务间共享
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<TimerSnapshot, TimerError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| TimerError::EngineStopped)?;
        response.await.map_err(|_| TimerError::EngineStopped)?
    }

    pub async fn start(&self, kind: SessionKind) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Start(kind)).await
    }

    pub async fn pause(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Resume).await
    }

    pub async fn reset(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Reset).await
    }

    pub async fn interrupt(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Interrupt).await
    }

    pub async fn set_note(&self, note: String) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::SetNote(note)).await
    }

    pub async fn snapshot(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Status).await
    }

    /// 停止引擎任务
    pub async fn shutdown(&self) -> Result<TimerSnapshot, TimerError> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// 在后台任务中运行引擎
pub fn spawn(engine: TimerEngine, ticks: TickReceiver) -> (EngineHandle, JoinHandle<()>) {
    let (requests, inbox) = mpsc::channel(REQUEST_QUEUE);
    let handle = EngineHandle {
        requests,
        events: engine.event_sender(),
    };
    let task = tokio::spawn(run(engine, inbox, ticks));
    (handle, task)
}

async fn run(mut engine: TimerEngine, mut inbox: mpsc::Receiver<Request>, mut ticks: TickReceiver) {
    info!("timer engine started");
    loop {
        tokio::select! {
            request = inbox.recv() => {
                let Some(Request { command, reply }) = request else {
                    break;
                };
                let stop = command == Command::Shutdown;
                let result = execute(&mut engine, command).await;
                let _ = reply.send(result);
                if stop {
                    break;
                }
            }
            Some(generation) = ticks.recv() => {
                match engine.tick(generation).await {
                    Ok(TickOutcome::Completed(report)) => {
                        info!(
                            kind = %report.session.kind,
                            next = %report.next_kind,
                            auto_started = report.auto_started,
                            failures = report.side_effect_failures.len(),
                            "completion processed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "tick failed"),
                }
            }
        }
    }
    info!("timer engine stopped");
}

async fn execute(engine: &mut TimerEngine, command: Command) -> Result<TimerSnapshot, TimerError> {
    // 挂起的完成必须先处理完，才能接受新的命令
    if !matches!(command, Command::Status | Command::Shutdown) {
        if let Some(report) = engine.settle().await? {
            info!(kind = %report.session.kind, next = %report.next_kind, "held-back completion persisted");
        }
    }
    match command {
        Command::Start(kind) => engine.start(kind),
        Command::Pause => engine.pause(),
        Command::Resume => engine.resume(),
        Command::Reset => engine.reset(),
        Command::Interrupt => engine.interrupt(),
        Command::SetNote(note) => engine.set_note(note),
        Command::Status | Command::Shutdown => Ok(engine.snapshot()),
    }
}

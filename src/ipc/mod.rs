// focus 与 focusd 之间的本地套接字协议，每行一个 JSON 对象

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, ToNsName};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::TimerError;
use crate::models::SessionKind;
use crate::pomodoro::runtime::{Command, EngineHandle};
use crate::pomodoro::TimerSnapshot;

pub const DEFAULT_SOCKET_NAME: &str = "focus-timer.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    Start { kind: SessionKind },
    Pause,
    Resume,
    Reset,
    Interrupt,
    Note { text: String },
    Status,
}

impl From<IpcRequest> for Command {
    fn from(request: IpcRequest) -> Self {
        match request {
            IpcRequest::Start { kind } => Command::Start(kind),
            IpcRequest::Pause => Command::Pause,
            IpcRequest::Resume => Command::Resume,
            IpcRequest::Reset => Command::Reset,
            IpcRequest::Interrupt => Command::Interrupt,
            IpcRequest::Note { text } => Command::SetNote(text),
            IpcRequest::Status => Command::Status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok { snapshot: TimerSnapshot },
    Error { code: String, message: String },
}

impl From<Result<TimerSnapshot, TimerError>> for IpcResponse {
    fn from(result: Result<TimerSnapshot, TimerError>) -> Self {
        match result {
            Ok(snapshot) => IpcResponse::Ok { snapshot },
            Err(e) => IpcResponse::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon closed the connection")]
    Closed,
}

/// 在本地套接字上接受命令，直到监听失败
pub async fn serve(socket_name: &str, engine: EngineHandle) -> Result<(), IpcError> {
    let name = socket_name.to_ns_name::<GenericNamespaced>()?;
    let listener = ListenerOptions::new().name(name).create_tokio()?;
    info!(socket = socket_name, "listening for timer commands");

    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn, engine).await {
                warn!(error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(conn: Stream, engine: EngineHandle) -> Result<(), IpcError> {
    let (recver, mut sender) = conn.split();
    let mut lines = BufReader::new(recver).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                debug!(?request, "ipc request");
                IpcResponse::from(engine.send(request.into()).await)
            }
            Err(e) => IpcResponse::Error {
                code: "bad_request".to_string(),
                message: e.to_string(),
            },
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        sender.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

/// 发送一条命令并等待回复
pub async fn request(socket_name: &str, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
    let name = socket_name.to_ns_name::<GenericNamespaced>()?;
    let conn = Stream::connect(name).await?;
    let (recver, mut sender) = conn.split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    sender.write_all(line.as_bytes()).await?;

    let mut reply = String::new();
    let read = BufReader::new(recver).read_line(&mut reply).await?;
    if read == 0 {
        return Err(IpcError::Closed);
    }
    Ok(serde_json::from_str(&reply)?)
}

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use focus_timer::clock::{tick_channel, SystemClock};
use focus_timer::config::{self, ConfigFile, ConfigProvider};
use focus_timer::ipc::{self, DEFAULT_SOCKET_NAME};
use focus_timer::notify;
use focus_timer::pomodoro::runtime::{self, EngineHandle};
use focus_timer::pomodoro::{EngineParts, TimerEngine};
use focus_timer::Database;

// 守护进程：持有唯一的计时引擎
pub struct Daemon {
    engine: EngineHandle,
    config: Arc<dyn ConfigProvider>,
    socket: String,
}

impl Daemon {
    pub fn new(db_path: PathBuf, config_path: PathBuf, socket: String) -> Result<(Self, tokio::task::JoinHandle<()>)> {
        let db = Arc::new(Database::open(&db_path).context("Failed to open database")?);
        let config: Arc<dyn ConfigProvider> = Arc::new(ConfigFile::new(config_path));

        let (tick_tx, tick_rx) = tick_channel();
        let parts = EngineParts {
            clock: Arc::new(SystemClock),
            sessions: db.clone(),
            tasks: db.clone(),
            stats: db,
            config: config.clone(),
        };
        let engine = TimerEngine::new(parts, tick_tx).context("Failed to initialize timer engine")?;
        let (engine, task) = runtime::spawn(engine, tick_rx);

        Ok((
            Self {
                engine,
                config,
                socket,
            },
            task,
        ))
    }

    /// 运行守护进程
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Focus daemon started");

        tokio::spawn(notify::watch_completions(
            self.engine.subscribe(),
            self.config.clone(),
        ));

        tokio::select! {
            served = ipc::serve(&self.socket, self.engine.clone()) => {
                served.context("IPC server stopped")?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutting down");
            }
        }

        // 正常退出时放弃未完成的会话，避免留下未结束记录
        if let Err(e) = self.engine.reset().await {
            tracing::warn!("Failed to reset timer on shutdown: {}", e);
        }
        self.engine.shutdown().await.ok();
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "focusd")]
#[command(about = "Focus timer daemon", long_about = None)]
struct Cli {
    /// Database path (defaults to user data directory)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Configuration file (defaults to user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket name to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_NAME)]
    socket: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let db_path = match cli.db_path {
        Some(path) => path,
        None => config::default_db_path().ok_or_else(|| anyhow!("Failed to get project directories"))?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path().ok_or_else(|| anyhow!("Failed to get project directories"))?,
    };

    tracing::info!("Using database: {:?}", db_path);
    tracing::info!("Using configuration: {:?}", config_path);

    let (daemon, engine_task) = Daemon::new(db_path, config_path, cli.socket)?;
    daemon.run().await?;
    engine_task.await.ok();

    Ok(())
}

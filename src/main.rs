use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use focus_timer::config::{self, Config};
use focus_timer::ipc::{self, IpcRequest, IpcResponse, DEFAULT_SOCKET_NAME};
use focus_timer::models::{Priority, SessionKind, Task};
use focus_timer::pomodoro::TimerSnapshot;
use focus_timer::{Database, StatsAggregator, TaskStore};

#[derive(Parser)]
#[command(name = "focus")]
#[command(about = "Focus timer with task tracking and daily statistics", long_about = None)]
struct Cli {
    /// Database path (defaults to user data directory)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Configuration file (defaults to user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Daemon socket name
    #[arg(long, default_value = DEFAULT_SOCKET_NAME)]
    socket: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Show daily statistics
    Stats {
        /// Day to show (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Number of days ending at --date
        #[arg(long, default_value_t = 1)]
        days: u32,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Control the timer running in focusd
    #[command(subcommand)]
    Timer(TimerCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a new task
    Add {
        /// Task name
        name: String,

        /// Estimated pomodoros
        #[arg(short, long, default_value_t = 0)]
        estimate: u32,

        /// low, medium or high
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        #[arg(long)]
        description: Option<String>,
    },

    /// List all tasks
    List,

    /// Make a task the current one
    Current {
        /// Task ID
        id: i64,
    },

    /// Mark a task as completed
    Complete {
        /// Task ID
        id: i64,
    },

    /// Delete a task
    Delete {
        /// Task ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration if none exists
    Init,
    /// Print the configuration file path
    Path,
}

#[derive(Subcommand)]
enum TimerCommand {
    /// Start a session: focus, short-break or long-break
    Start {
        #[arg(default_value = "focus")]
        kind: SessionKind,
    },
    Pause,
    Resume,
    /// Abandon the current session
    Reset,
    /// Record an interruption
    Interrupt,
    /// Attach a note to the current session
    Note { text: String },
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Task(command) => {
            let db = open_db(cli.db_path)?;
            run_task(&db, command)
        }
        Commands::Stats { date, days } => {
            let db = open_db(cli.db_path)?;
            run_stats(&db, date, days)
        }
        Commands::Config(command) => run_config(cli.config, command),
        Commands::Timer(command) => run_timer(&cli.socket, command).await,
    }
}

fn open_db(path: Option<PathBuf>) -> Result<Database> {
    let path = match path {
        Some(path) => path,
        None => config::default_db_path().ok_or_else(|| anyhow!("Failed to get project directories"))?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    Database::open(&path).with_context(|| format!("Failed to open database {}", path.display()))
}

fn config_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => config::default_config_path().ok_or_else(|| anyhow!("Failed to get project directories")),
    }
}

fn run_task(db: &Database, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add {
            name,
            estimate,
            priority,
            description,
        } => {
            let mut task = Task::new(name);
            task.estimated_pomodoros = estimate;
            task.priority = priority;
            task.description = description;
            let id = db.create(&task)?;
            println!("✅ Task created with ID: {}", id);
        }
        TaskCommand::List => {
            let tasks = db.list()?;
            if tasks.is_empty() {
                println!("No tasks found.");
            }
            for task in tasks {
                let status_icon = if task.completed {
                    "✅"
                } else if task.is_current {
                    "🔄"
                } else {
                    "⭕"
                };
                let priority_icon = match task.priority {
                    Priority::High => "🔴",
                    Priority::Medium => "🟡",
                    Priority::Low => "🟢",
                };
                let overdue = if task.is_overdue() { " ⚠" } else { "" };
                println!(
                    "[{}] {} {} {} 🍅 {}/{}{}",
                    task.id.unwrap_or_default(),
                    status_icon,
                    priority_icon,
                    task.name,
                    task.completed_pomodoros,
                    task.estimated_pomodoros,
                    overdue
                );
            }
        }
        TaskCommand::Current { id } => {
            db.set_current(id)?;
            println!("🔄 Task {} is now current", id);
        }
        TaskCommand::Complete { id } => {
            if db.complete(id)? {
                db.record_completed_task(Local::now().date_naive())?;
                println!("✅ Task {} marked as completed", id);
            } else {
                println!("Task {} was already completed", id);
            }
        }
        TaskCommand::Delete { id } => {
            db.delete(id)?;
            println!("🗑 Task {} deleted", id);
        }
    }
    Ok(())
}

fn run_stats(db: &Database, date: Option<NaiveDate>, days: u32) -> Result<()> {
    let to = date.unwrap_or_else(|| Local::now().date_naive());
    let from = to - Duration::days(i64::from(days.max(1)) - 1);
    let rows = db.range(from, to)?;
    if rows.is_empty() {
        println!("No sessions recorded between {} and {}.", from, to);
        return Ok(());
    }
    for stats in rows {
        println!(
            "{}  focus {:>2} ({:>3} min)  breaks {:>2} ({:>3} min)  quality {:.2}  interruptions {}  tasks done {}",
            stats.day,
            stats.completed_focus,
            stats.total_focus_ms / 60_000,
            stats.completed_breaks,
            stats.total_break_ms / 60_000,
            stats.average_quality,
            stats.total_interruptions,
            stats.completed_tasks
        );
    }
    Ok(())
}

fn run_config(path: Option<PathBuf>, command: ConfigCommand) -> Result<()> {
    let path = config_path(path)?;
    match command {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Show => {
            let config = if path.exists() {
                Config::load(&path)?
            } else {
                Config::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Init => {
            if path.exists() {
                println!("Configuration already exists at {}", path.display());
            } else {
                Config::default().save(&path)?;
                println!("Wrote {}", path.display());
            }
        }
    }
    Ok(())
}

async fn run_timer(socket: &str, command: TimerCommand) -> Result<()> {
    let request = match command {
        TimerCommand::Start { kind } => IpcRequest::Start { kind },
        TimerCommand::Pause => IpcRequest::Pause,
        TimerCommand::Resume => IpcRequest::Resume,
        TimerCommand::Reset => IpcRequest::Reset,
        TimerCommand::Interrupt => IpcRequest::Interrupt,
        TimerCommand::Note { text } => IpcRequest::Note { text },
        TimerCommand::Status => IpcRequest::Status,
    };
    let response = ipc::request(socket, &request)
        .await
        .context("Failed to reach focusd (is the daemon running?)")?;
    match response {
        IpcResponse::Ok { snapshot } => {
            print_snapshot(&snapshot);
            Ok(())
        }
        IpcResponse::Error { code, message } => bail!("{} ({})", message, code),
    }
}

fn print_snapshot(snapshot: &TimerSnapshot) {
    let seconds = snapshot.remaining_ms.max(0) / 1000;
    println!(
        "{:?} {} {:02}:{:02}  interruptions {}  next {}  focus today {}",
        snapshot.state,
        snapshot.session_kind,
        seconds / 60,
        seconds % 60,
        snapshot.interruptions,
        snapshot.next_kind,
        snapshot.completed_focus
    );
}

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use tasksync::{
    Clock, MemoryRemote, Operation, Predicate, RestRemote, StoreAdapter, SyncConfig, SyncEngine,
    SyncEngineBuilder, SystemClock, Table, Task, open_local,
};

/// Manage tasks in the local store and sync them with the backend.
///
/// Configuration comes from TASKSYNC_* environment variables (a `.env` file
/// is read too).
#[derive(Parser)]
#[command(name = "tasksync", version)]
struct Cli {
    /// Signed-in user the data belongs to
    #[arg(long, global = true, env = "TASKSYNC_OWNER", default_value = "local-user")]
    owner: String,

    /// Bearer token for the backend; the API key is used when absent
    #[arg(long, global = true, env = "TASKSYNC_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task
    AddTask {
        title: String,
        #[arg(long, default_value_t = 3)]
        priority: u8,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Mark a task as completed
    Complete { id: String },
    /// Delete a task
    Delete { id: String },
    /// List tasks
    List {
        /// Only tasks with unpushed edits
        #[arg(long)]
        dirty: bool,
    },
    /// Run one sync cycle
    Sync,
    /// Sync in the background until interrupted
    Watch,
    /// Show sync status
    Status,
    /// Show queued changes
    Pending,
    /// Give parked changes another round of attempts
    Retry,
}

async fn build_engine(cli: &Cli, config: SyncConfig) -> anyhow::Result<SyncEngine> {
    let local = open_local(&config)
        .await
        .context("Failed to open local store")?;
    let remote: Arc<dyn StoreAdapter> = match &config.remote_url {
        Some(_) => {
            let mut rest = RestRemote::from_config(&config)?;
            if let Some(token) = &cli.token {
                rest = rest.with_access_token(token.clone());
            }
            log::info!("Remote store: {}", rest.base_url());
            Arc::new(rest)
        }
        None => {
            log::warn!("TASKSYNC_REMOTE_URL is not set, changes stay queued locally");
            let offline = MemoryRemote::new();
            offline.set_online(false);
            Arc::new(offline)
        }
    };
    let engine = SyncEngineBuilder::new(cli.owner.clone())
        .local(local)
        .remote(remote)
        .config(config)
        .build()
        .await?;
    Ok(engine)
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn print_task(task: &Task) {
    let mark = if task.is_completed() { "x" } else { " " };
    let dirty = if task.synced_at.is_none_or(|s| s < task.updated_at) {
        " *"
    } else {
        ""
    };
    println!(
        "[{mark}] {}  {} (p{}){dirty}",
        task.id,
        task.title,
        u8::from(task.priority)
    );
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let engine = build_engine(&cli, config).await?;

    match cli.command {
        Command::AddTask {
            title,
            priority,
            project,
            description,
        } => {
            let id = uuid::Uuid::new_v4().to_string();
            let mut fields = payload(json!({
                "title": title,
                "priority": priority,
                "status": "to_do",
            }));
            if let Some(project) = project {
                fields.insert("projectId".into(), project.into());
            }
            if let Some(description) = description {
                fields.insert("description".into(), description.into());
            }
            engine
                .submit_mutation(Table::Tasks, &id, Operation::Create, fields)
                .await?;
            println!("{id}");
        }
        Command::Complete { id } => {
            let now = SystemClock.now();
            let fields = payload(json!({"status": "completed", "completedAt": now}));
            engine
                .submit_mutation(Table::Tasks, &id, Operation::Update, fields)
                .await?;
        }
        Command::Delete { id } => {
            engine
                .submit_mutation(Table::Tasks, &id, Operation::Delete, Map::new())
                .await?;
        }
        Command::List { dirty } => {
            if dirty {
                for record in engine.list(Table::Tasks, Predicate::Dirty).await? {
                    println!("{}", serde_json::to_string(&record)?);
                }
            } else {
                let tasks: Vec<Task> = engine.list_entities().await?;
                for task in &tasks {
                    print_task(task);
                }
            }
        }
        Command::Sync => {
            let report = engine.request_sync().await;
            println!(
                "pushed {}, pulled {} ({} kept local)",
                report.pushed,
                report.local_mutations(),
                report.pull.kept_local
            );
            for failure in &report.failures {
                eprintln!(
                    "  {} {}/{}: {}",
                    failure.operation.as_str(),
                    failure.table,
                    failure.record_id,
                    failure.message
                );
            }
            if let Some(error) = report.first_error() {
                bail!("sync incomplete: {error}");
            }
        }
        Command::Watch => {
            let handle = engine.start();
            let mut status = engine.subscribe_status();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!("{}", status.borrow_and_update().summary());
                    }
                }
            }
            handle.shutdown().await;
        }
        Command::Status => println!("{}", engine.status().summary()),
        Command::Pending => {
            for entry in engine.pending_changes() {
                println!(
                    "{:>4} {:<7} {}/{} [{}] attempts={}",
                    entry.sequence,
                    entry.operation.as_str(),
                    entry.key.table,
                    entry.key.record_id,
                    entry.state.as_str(),
                    entry.attempts
                );
            }
        }
        Command::Retry => {
            let moved = engine.retry_failed().await;
            println!("{moved} change(s) requeued");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli).await
}

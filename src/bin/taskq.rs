//! taskq CLI: run workers and operate on a queue store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use taskq::config::Config;
use taskq::engine::{
    EchoExecutor, Housekeeper, HousekeeperConfig, TaskClaimer, WorkerConfig, WorkerLoop,
};
use taskq::health::HealthMonitor;
use taskq::maintenance::{Maintenance, RetentionMode};
use taskq::model::{Capabilities, NewTask, TaskId, TaskStatus, capability};
use taskq::observability::get_queue_metrics;
use taskq::store::tasks::TaskFilter;
use taskq::store::{Store, StoreOptions};
use taskq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskq", about = "Durable task queue on an embedded store")]
struct Cli {
    /// Config file (.toml or .json). TASKQ_* variables override it.
    #[arg(long, short, global = true, env = "TASKQ_CONFIG")]
    config: Option<PathBuf>,
    /// Store file, overriding the config.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker loop with the echo executor
    Worker {
        /// Worker id, overriding the config
        #[arg(long)]
        worker_id: Option<String>,
        /// Only claim these task types (repeatable)
        #[arg(long = "type")]
        task_types: Vec<String>,
    },
    /// Run the housekeeper loop (reclaim, sweep, retention, checkpoint, backup)
    Housekeep {
        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Enqueue a task
    Enqueue {
        task_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Lower = more urgent
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Required capability, key=value (repeatable)
        #[arg(long = "require")]
        requirements: Vec<String>,
        /// Seconds before the task becomes claimable
        #[arg(long)]
        delay: Option<i64>,
    },
    /// List tasks
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long = "type")]
        task_type: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one task
    Show {
        /// Task ID (full UUID or unique prefix)
        id: String,
    },
    /// Cancel a queued task
    Cancel { id: String },
    /// Print queue metrics as JSON
    Metrics,
    /// List registered workers
    Workers,
    /// Reclaim expired leases now
    Reclaim,
    /// Remove terminal tasks past retention
    Vacuum {
        /// Override retention, in seconds
        #[arg(long)]
        older_than: Option<u64>,
        #[arg(long)]
        archive: bool,
    },
    /// Checkpoint the WAL
    Checkpoint,
    /// Snapshot the store into a directory
    Backup {
        /// Destination directory, overriding maintenance.backup_dir
        dest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides(std::env::vars())?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Command::Worker {
        worker_id: Some(id),
        ..
    } = &cli.command
    {
        config.worker_id = id.clone();
    }
    if config.worker_id.is_empty() && !matches!(cli.command, Command::Worker { .. }) {
        config.worker_id = format!("taskq-cli-{}", std::process::id());
    }
    config.validate()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "taskq"))?;
    let store = Store::open(&config.store_path, StoreOptions::default()).await?;

    match cli.command {
        Command::Worker { task_types, .. } => cmd_worker(&config, store, task_types).await,
        Command::Housekeep { once } => cmd_housekeep(&config, store, once).await,
        Command::Enqueue {
            task_type,
            payload,
            priority,
            max_attempts,
            requirements,
            delay,
        } => {
            cmd_enqueue(
                &config,
                &store,
                task_type,
                payload,
                priority,
                max_attempts,
                requirements,
                delay,
            )
            .await
        }
        Command::List {
            status,
            task_type,
            limit,
        } => cmd_list(&store, status, task_type, limit).await,
        Command::Show { id } => cmd_show(&store, &id).await,
        Command::Cancel { id } => {
            let id = resolve_id(&store, &id).await?;
            let task = store.cancel_task(id).await?;
            println!("Cancelled: {}", task.id);
            Ok(())
        }
        Command::Metrics => {
            let metrics = get_queue_metrics(&store, config.stale_after()).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Command::Workers => cmd_workers(&config, &store).await,
        Command::Reclaim => {
            let report = health(&config, &store).reclaim_expired_leases().await?;
            println!(
                "Requeued {}, failed {}",
                report.requeued.len(),
                report.failed.len()
            );
            Ok(())
        }
        Command::Vacuum {
            older_than,
            archive,
        } => {
            let mut maintenance = maintenance(&config, &store);
            if archive {
                maintenance = maintenance.with_retention_mode(RetentionMode::Archive);
            }
            let seconds = older_than.unwrap_or(config.maintenance.retention_seconds);
            let report = maintenance
                .vacuum_completed(chrono::Duration::seconds(seconds as i64))
                .await?;
            println!(
                "Removed {} task(s) in {} batch(es), {} archived",
                report.removed, report.batches, report.archived
            );
            Ok(())
        }
        Command::Checkpoint => {
            let stats = maintenance(&config, &store).checkpoint().await?;
            println!(
                "Checkpointed {}/{} frames{}",
                stats.checkpointed_frames,
                stats.log_frames,
                if stats.busy { " (busy)" } else { "" }
            );
            Ok(())
        }
        Command::Backup { dest } => {
            let dest = dest
                .or_else(|| config.maintenance.backup_dir.clone())
                .ok_or_else(|| {
                    anyhow::anyhow!("no destination: pass one or set maintenance.backup_dir")
                })?;
            let record = maintenance(&config, &store).backup(&dest).await?;
            println!("Backup:   {}", record.path.display());
            println!("SHA-256:  {}", record.checksum);
            println!("Taken at: {}", record.timestamp);
            Ok(())
        }
    }
}

fn health(config: &Config, store: &Store) -> HealthMonitor {
    HealthMonitor::new(store.clone()).with_max_reclaims(config.maintenance.max_reclaims)
}

fn maintenance(config: &Config, store: &Store) -> Maintenance {
    Maintenance::new(store.clone())
        .with_retention_mode(config.maintenance.retention_mode)
        .with_batch_size(config.maintenance.vacuum_batch_size)
}

async fn cmd_worker(config: &Config, store: Store, task_types: Vec<String>) -> anyhow::Result<()> {
    let claimer = TaskClaimer::new(store.clone(), config.strategy())
        .with_retry_policy(config.retry_policy())
        .with_executor(Arc::new(EchoExecutor))
        .with_reclaim_on_claim(true, config.maintenance.max_reclaims);

    let mut worker_config = WorkerConfig::from_config(config);
    if !task_types.is_empty() {
        worker_config.task_types = Some(task_types);
    }

    let worker = WorkerLoop::new(Arc::new(claimer), health(config, &store), worker_config);

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    store.close().await;
    Ok(())
}

async fn cmd_housekeep(config: &Config, store: Store, once: bool) -> anyhow::Result<()> {
    let housekeeper = Arc::new(Housekeeper::new(
        health(config, &store),
        maintenance(config, &store),
        HousekeeperConfig::from_config(config),
    ));

    if once {
        let report = housekeeper.run_cycle().await;
        if let Some(reclaimed) = &report.reclaimed {
            println!(
                "Reclaimed: {} requeued, {} failed",
                reclaimed.requeued.len(),
                reclaimed.failed.len()
            );
        }
        if let Some(vacuum) = &report.vacuum {
            println!("Vacuumed:  {} removed", vacuum.removed);
        }
        if let Some(record) = &report.backup {
            println!("Backup:    {}", record.path.display());
        }
    } else {
        let handle = Arc::clone(&housekeeper);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            handle.shutdown();
        });
        housekeeper.run().await;
    }

    store.close().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_enqueue(
    config: &Config,
    store: &Store,
    task_type: String,
    payload: Option<String>,
    priority: i32,
    max_attempts: Option<u32>,
    requirements: Vec<String>,
    delay: Option<i64>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let requirements = requirements
        .iter()
        .map(|pair| capability::parse_pair(pair))
        .collect::<Result<Capabilities, _>>()?;

    let mut new = NewTask::new(task_type)
        .payload(payload)
        .priority(priority)
        .requirements(requirements);
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }
    if let Some(secs) = delay {
        new = new.delay(chrono::Duration::seconds(secs));
    }

    let task = store.enqueue(new, &config.attempt_limits()).await?;
    println!(
        "Enqueued: {} (max attempts: {})",
        task.id, task.max_attempts
    );
    Ok(())
}

async fn cmd_list(
    store: &Store,
    status: Option<TaskStatus>,
    task_type: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let tasks = store
        .list_tasks(&TaskFilter {
            status,
            task_type,
            limit: Some(limit),
        })
        .await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<10}  {:>4}  {:>8}  {:<20}  CREATED",
        "ID", "TYPE", "STATUS", "PRI", "ATTEMPTS", "OWNER"
    );
    println!("{}", "-".repeat(96));

    for task in &tasks {
        let id = task.id.to_string();
        println!(
            "{:<8}  {:<16}  {:<10}  {:>4}  {:>8}  {:<20}  {}",
            &id[..8],
            task.task_type,
            task.status,
            task.priority,
            format!("{}/{}", task.attempt_count, task.max_attempts),
            task.claimed_by.as_deref().unwrap_or("-"),
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_show(store: &Store, id: &str) -> anyhow::Result<()> {
    let task = store.get_task(resolve_id(store, id).await?).await?;

    println!("ID:          {}", task.id);
    println!("Type:        {}", task.task_type);
    println!("Status:      {}", task.status);
    println!("Priority:    {}", task.priority);
    println!("Attempts:    {}/{}", task.attempt_count, task.max_attempts);
    println!("Reclaims:    {}", task.reclaim_count);
    let payload = serde_json::to_string_pretty(&task.payload)?;
    println!("Payload:     {payload}");
    if !task.requirements.is_empty() {
        let requirements = serde_json::to_string(&task.requirements)?;
        println!("Requires:    {requirements}");
    }
    println!("Created:     {}", task.created_at);
    println!("Updated:     {}", task.updated_at);
    println!("Not before:  {}", task.not_before);
    if let Some(owner) = &task.claimed_by {
        println!("Owner:       {owner}");
    }
    if let Some(expires) = task.lease_expires_at {
        println!("Lease until: {expires}");
    }
    if let Some(done) = task.completed_at {
        println!("Completed:   {done}");
    }
    if let Some(err) = &task.last_error {
        println!("Last error:  {err}");
    }
    if let Some(result) = &task.result {
        println!("Result:      {}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

async fn cmd_workers(config: &Config, store: &Store) -> anyhow::Result<()> {
    let workers = store.list_workers().await?;
    if workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }

    let now = store.clock().now();
    println!(
        "{:<24}  {:<7}  {:>9}  {:<20}  CAPABILITIES",
        "WORKER", "STATUS", "PROCESSED", "LAST HEARTBEAT"
    );
    for worker in &workers {
        println!(
            "{:<24}  {:<7}  {:>9}  {:<20}  {}",
            worker.worker_id,
            worker.status(now, config.stale_after()),
            worker.tasks_processed_count,
            worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_string(&worker.capabilities)?
        );
    }
    Ok(())
}

/// Accept a full UUID or a unique prefix of one.
async fn resolve_id(store: &Store, raw: &str) -> anyhow::Result<TaskId> {
    if let Ok(id) = raw.parse::<TaskId>() {
        return Ok(id);
    }
    let tasks = store.list_tasks(&TaskFilter::default()).await?;
    let matches: Vec<TaskId> = tasks
        .iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no task matching '{raw}'"),
        [id] => Ok(*id),
        many => anyhow::bail!("{} tasks match '{raw}', be more specific", many.len()),
    }
}

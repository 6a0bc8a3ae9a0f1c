//! fleetspec CLI - Command line interface for the fleetspec scheduler.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use fleetspec_core::{
    NewTask, NewTaskset, Referable, Reference, Taskset, TasksetId, TasksetStatus, TimeoutPolicy,
    WorkerInfo,
};
use fleetspec_proto::{
    wait_for, Command, TasksetSummary, Transport, TransportConfig, TransportEvent,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// fleetspec CLI - distributed test-suite runner
#[derive(Parser)]
#[command(name = "fleetspec")]
#[command(about = "CLI for the fleetspec scheduler", long_about = None)]
struct Cli {
    /// Scheduler address
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: String,

    /// Seconds to wait for one call's reply
    #[arg(long, default_value_t = 30)]
    call_timeout_secs: u64,

    /// Log level (logs go to stderr)
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a taskset from spec files and start it
    Start {
        /// Owner name (defaults to $USER)
        #[arg(long)]
        rsync_name: Option<String>,

        /// Kind of executor to run on
        #[arg(long, default_value = "default")]
        worker_type: String,

        /// Executors working the taskset at once
        #[arg(long, default_value_t = 1)]
        max_workers: u32,

        /// Failed trials a spec may have before it fails
        #[arg(long, default_value_t = 1)]
        max_trials: u32,

        /// Executor profile; scopes duration history
        #[arg(long, default_value = "default")]
        taskset_class: String,

        /// Command run once per executor before taking specs
        #[arg(long, default_value = "")]
        setup_command: String,

        /// Command run per slave process
        #[arg(long, default_value = "")]
        slave_command: String,

        /// Soft timeout for specs with no history
        #[arg(long, default_value_t = 720)]
        unknown_spec_timeout_sec: u64,

        /// Lower bound on any soft timeout
        #[arg(long, default_value_t = 60)]
        least_timeout_sec: u64,

        /// Soft timeout as a multiple of the average duration
        #[arg(long, default_value_t = 2)]
        average_multiplier: u64,

        /// Hard timeout margin over the soft timeout
        #[arg(long, default_value_t = 60)]
        hard_timeout_margin_sec: u64,

        /// Wait for the taskset to finish after starting it
        #[arg(long)]
        wait: bool,

        /// Spec files to run
        #[arg(required = true)]
        spec_files: Vec<PathBuf>,
    },

    /// Cancel a taskset
    Cancel {
        /// Taskset ID
        id: u64,
    },

    /// Cancel every active taskset of an owner
    Cancelall {
        /// Owner (rsync) name
        rsync_name: String,
    },

    /// List active tasksets
    Actives {
        /// Only tasksets of this owner
        #[arg(long)]
        rsync_name: Option<String>,
    },

    /// List live workers
    Nodes,

    /// Wait until a taskset finishes
    Waitfor {
        /// Taskset ID
        id: u64,
    },

    /// Show the result of a taskset
    Show {
        /// Taskset ID
        id: u64,

        /// Exit code when the taskset did not succeed
        #[arg(long, default_value_t = 1)]
        failure_exit_code: i32,

        /// Print each trial's output
        #[arg(short, long)]
        verbose: bool,

        /// Print the raw summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let waits = matches!(
        cli.command,
        Commands::Waitfor { .. } | Commands::Start { wait: true, .. }
    );
    let config = TransportConfig {
        addr: cli.addr,
        auto_reconnect: waits,
        call_timeout: Duration::from_secs(cli.call_timeout_secs),
        ..Default::default()
    };
    let (transport, mut events) = Transport::spawn(config);

    if !await_connected(&mut events).await {
        return Err("could not connect to the scheduler".into());
    }

    let exit_code = run(cli.command, &transport, &mut events).await;
    transport.close();

    match exit_code? {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

async fn await_connected(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> bool {
    while let Some(event) = events.recv().await {
        if event == TransportEvent::Connected {
            return true;
        }
    }
    false
}

/// Run one command on a connected transport. Returns the exit code.
async fn run(
    command: Commands,
    transport: &Transport,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> CliResult<i32> {
    match command {
        Commands::Start {
            rsync_name,
            worker_type,
            max_workers,
            max_trials,
            taskset_class,
            setup_command,
            slave_command,
            unknown_spec_timeout_sec,
            least_timeout_sec,
            average_multiplier,
            hard_timeout_margin_sec,
            wait,
            spec_files,
        } => {
            let spec = NewTaskset {
                rsync_name: rsync_name
                    .or_else(|| std::env::var("USER").ok())
                    .ok_or("--rsync-name is required when $USER is unset")?,
                setup_command,
                slave_command,
                worker_type,
                max_workers,
                max_trials,
                taskset_class,
                timeout_policy: TimeoutPolicy {
                    unknown_spec_timeout_sec,
                    least_timeout_sec,
                    average_multiplier,
                    hard_timeout_margin_sec,
                },
                tasks: hash_spec_files(&spec_files).await?,
            };

            let taskset = start(transport, spec).await?;
            println!("{}", taskset.id());

            if wait {
                let status = wait_for(transport, events, taskset).await?;
                println!("{}", status);
            }
        }
        Commands::Cancel { id } => {
            let status: TasksetStatus = transport
                .call_as(Command::CancelTaskset {
                    taskset: TasksetId::new(id).to_ref(),
                })
                .await?;
            println!("taskset {}: {}", id, status);
        }
        Commands::Cancelall { rsync_name } => {
            let cancelled: Vec<Reference> = transport
                .call_as(Command::CancelUserTasksets { rsync_name })
                .await?;
            for taskset in &cancelled {
                println!("cancelled {}", taskset.id());
            }
        }
        Commands::Actives { rsync_name } => {
            let tasksets: Vec<Taskset> = transport
                .call_as(Command::ListActiveTasksets { rsync_name })
                .await?;
            print_actives(&tasksets);
        }
        Commands::Nodes => {
            let workers: Vec<WorkerInfo> = transport.call_as(Command::ListWorkers).await?;
            print_nodes(&workers);
        }
        Commands::Waitfor { id } => {
            let status = wait_for(transport, events, TasksetId::new(id).to_ref()).await?;
            println!("{}", status);
        }
        Commands::Show {
            id,
            failure_exit_code,
            verbose,
            json,
        } => {
            let summary: TasksetSummary = transport
                .call_as(Command::QueryTaskset {
                    taskset: TasksetId::new(id).to_ref(),
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary, verbose);
            }
            if summary.taskset.status != TasksetStatus::Succeeded {
                return Ok(failure_exit_code);
            }
        }
    }

    Ok(0)
}

/// Read each spec file and pair it with the SHA-256 of its content.
async fn hash_spec_files(paths: &[PathBuf]) -> CliResult<Vec<NewTask>> {
    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
        let hash = hex::encode(Sha256::digest(&content));
        tasks.push(NewTask::new(path.display().to_string(), hash));
    }
    Ok(tasks)
}

/// Create the taskset and mark its sources as distributed.
async fn start(transport: &Transport, spec: NewTaskset) -> CliResult<Reference> {
    let taskset: Reference = transport.call_as(Command::CreateTaskset(spec)).await?;
    transport
        .call(Command::StartTaskset { taskset })
        .await?;
    Ok(taskset)
}

fn print_actives(tasksets: &[Taskset]) {
    println!("Active tasksets ({}):", tasksets.len());
    println!(
        "{:<8}  {:<14}  {:<16}  {:<16}  {}",
        "ID", "STATUS", "OWNER", "CLASS", "CREATED"
    );
    println!("{}", "-".repeat(80));

    for taskset in tasksets {
        println!(
            "{:<8}  {:<14}  {:<16}  {:<16}  {}",
            taskset.id,
            taskset.status,
            taskset.rsync_name,
            taskset.taskset_class,
            taskset.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_nodes(workers: &[WorkerInfo]) {
    println!("Workers ({}):", workers.len());
    println!("{:<24}  {:<16}  {}", "NAME", "TASKSET", "UPDATED");
    println!("{}", "-".repeat(80));

    for worker in workers {
        let taskset = worker
            .current_taskset
            .map(|r| r.id().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24}  {:<16}  {}",
            worker.name,
            taskset,
            worker.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_summary(summary: &TasksetSummary, verbose: bool) {
    let taskset = &summary.taskset;
    println!("Taskset {}", taskset.id);
    println!("  Status:     {}", taskset.status);
    println!("  Owner:      {}", taskset.rsync_name);
    println!("  Class:      {}", taskset.taskset_class);
    println!("  Created:    {}", taskset.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished_at) = taskset.finished_at {
        println!("  Finished:   {}", finished_at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Queued:     {}", summary.queue_size);

    println!();
    println!("{:<10}  {:<8}  {}", "STATUS", "TRIALS", "SPEC");
    println!("{}", "-".repeat(80));
    for entry in &summary.tasks {
        println!(
            "{:<10}  {:<8}  {}",
            entry.task.status,
            entry.trials.len(),
            entry.task.spec_file
        );
        if !verbose {
            continue;
        }
        for trial in &entry.trials {
            let duration = trial
                .duration()
                .map(|d| format!("{}s", d.num_seconds()))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    trial {}: {} ({} passed, {} pending, {} failed, {})",
                trial.id, trial.status, trial.passed, trial.pending, trial.failed, duration
            );
            if !trial.stdout.is_empty() {
                println!("{}", trial.stdout);
            }
            if !trial.stderr.is_empty() {
                eprintln!("{}", trial.stderr);
            }
        }
    }

    if !taskset.log.is_empty() {
        println!();
        println!("Log:");
        println!("{}", taskset.log);
    }
}

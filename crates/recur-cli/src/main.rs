use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use recur_core::config::RecurConfig;
use recur_core::time::fmt_opt_ts;
use recur_core::{RunEvent, RunMetadata, RunState};
use recur_driver::Driver;
use tracing::{info, warn};

const TAIL_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "recur", version, about = "Durable scheduler for recurring jobs")]
struct Cli {
    /// Config file (default: $RECUR_CONFIG, then ~/.recur/recur.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add or update a job from a YAML or JSON definition file.
    Add { file: PathBuf },
    /// List jobs with their next due time.
    List,
    /// Show a job, its schedule and its recent runs.
    Show {
        job: String,
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
    Pause { job: String },
    Resume { job: String },
    /// Delete a job and everything recorded for it.
    Delete { job: String },
    /// Run a job immediately, outside its schedule.
    RunNow {
        job: String,
        /// JSON object replacing the job's inputs for this run.
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Exercise a job's run and artifact path without calling the executor.
    DryRun { job: String },
    /// Print a run's events.
    Logs { run: String },
    /// Follow a run's events until it finishes.
    Tail { run: String },
    /// Execute pending runs once, or keep polling with --watch.
    Process {
        #[arg(long)]
        watch: bool,
    },
    /// Recompute every job's next due time.
    UpdateSchedules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "recur=info,recur_driver=info,recur_runner=info,recur_scheduler=info,recur_store=warn"
                    .into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit flag > RECUR_CONFIG env > ~/.recur/recur.toml
    let config_path = cli.config.or_else(|| std::env::var("RECUR_CONFIG").ok());
    let config = RecurConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({e}), using defaults");
        RecurConfig::default()
    });
    let driver = Driver::new(&config).context("failed to open the job store")?;

    match cli.command {
        Command::Add { file } => {
            let (job, schedule) = driver
                .add_job_file(&file)
                .with_context(|| format!("could not add {}", file.display()))?;
            println!(
                "added {} (v{}), next due {}",
                job.id,
                job.version,
                fmt_opt_ts(schedule.next_due).unwrap_or_else(|| "never".into())
            );
        }
        Command::List => {
            for (job, schedule) in driver.list_jobs()? {
                let next = schedule
                    .and_then(|s| fmt_opt_ts(s.next_due))
                    .unwrap_or_else(|| "-".into());
                let status = if job.enabled { "enabled" } else { "paused" };
                println!("{:<24} {:<8} {:<16} {}  {}", job.id, status, job.concurrency.as_str(), job.schedule, next);
            }
        }
        Command::Show { job, runs } => {
            let overview = driver.show_job(&job, runs)?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
        Command::Pause { job } => {
            driver.pause_job(&job)?;
            println!("paused {job}");
        }
        Command::Resume { job } => {
            let schedule = driver.resume_job(&job)?;
            println!(
                "resumed {job}, next due {}",
                fmt_opt_ts(schedule.next_due).unwrap_or_else(|| "never".into())
            );
        }
        Command::Delete { job } => {
            driver.delete_job(&job)?;
            println!("deleted {job}");
        }
        Command::RunNow { job, inputs } => {
            let inputs = inputs
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--inputs is not valid JSON")?;
            let run = driver.run_now(&job, inputs).await?;
            report_run(&run)?;
        }
        Command::DryRun { job } => {
            let run = driver.dry_run(&job)?;
            report_run(&run)?;
        }
        Command::Logs { run } => {
            for event in driver.run_events(&run)? {
                print_event(&event);
            }
        }
        Command::Tail { run } => tail(&driver, &run).await?,
        Command::Process { watch } => {
            if watch {
                let (tx, rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received");
                        let _ = tx.send(true);
                    }
                });
                driver.run(rx).await;
            } else {
                let summary = driver.process_pending_runs().await?;
                println!("{}", serde_json::to_string(&summary)?);
                if summary.errors > 0 {
                    bail!("{} run(s) could not be executed", summary.errors);
                }
            }
        }
        Command::UpdateSchedules => {
            let scheduled = driver.update_schedules()?;
            println!("{scheduled} job(s) scheduled");
        }
    }
    Ok(())
}

/// Print the run's outcome; anything but SUCCEEDED is a failed command.
fn report_run(run: &RunMetadata) -> anyhow::Result<()> {
    println!("run {} {}", run.id, run.state);
    if run.state != RunState::Succeeded {
        bail!(
            "run {} ended {}: {}",
            run.id,
            run.state,
            run.error_message.as_deref().unwrap_or("no reason recorded")
        );
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    println!("{}", event.log_line());
}

async fn tail(driver: &Driver, run_id: &str) -> anyhow::Result<()> {
    let mut last_id = 0;
    loop {
        let finished = driver.get_run(run_id)?.state.is_finished();
        for event in driver.events_after(run_id, last_id)? {
            last_id = event.id;
            print_event(&event);
        }
        if finished {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(TAIL_POLL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

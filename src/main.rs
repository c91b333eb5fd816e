use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use cadence::config::Config;
use cadence::core::{Plan, TaskGraph};
use cadence::estimation::{CriticalPathEstimator, ThroughputTracker};
use cadence::milestone::{DelayRule, MilestoneTracker};
use cadence::orchestration::{Scheduler, SchedulerEvent};
use cadence::state::StateStore;
use cadence::{clog, clog_warn, Result};

/// Cadence - dependency-aware task orchestration for agent pools
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadence/cadence.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.cadence/cadence.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan through the configured agents
    Run {
        /// Plan file (JSON with "tasks" and "milestones")
        plan: PathBuf,
    },

    /// Project durations, the critical path and a timeline for a plan
    Estimate {
        /// Plan file (JSON with "tasks" and "milestones")
        plan: PathBuf,
    },

    /// Show persisted milestone state
    Milestones,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    cadence::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run { plan } => run_plan(&config, &plan),
        Command::Estimate { plan } => run_estimate(&config, &plan),
        Command::Milestones => run_milestones(&config),
    }
}

/// Throughput statistics warmed from persisted agent history.
fn load_throughput(config: &Config, store: &StateStore) -> ThroughputTracker {
    match store.load_agent_histories() {
        Ok(histories) => {
            ThroughputTracker::from_histories(config.default_task_duration_secs, &histories)
        }
        Err(e) => {
            clog_warn!("Ignoring agent history: {}", e);
            ThroughputTracker::new(config.default_task_duration_secs)
        }
    }
}

fn run_plan(config: &Config, plan_path: &Path) -> Result<()> {
    clog!("Run command: plan={}", plan_path.display());
    let plan = Plan::load(plan_path)?;
    let store = config.store()?;
    let throughput = load_throughput(config, &store);

    // Estimate milestone windows against the whole plan before anything runs.
    let preview = TaskGraph::from_tasks(plan.tasks.iter().cloned().map(|t| t.into_task()))?;
    // Milestones from earlier runs stay on record; the plan's own replace them by id.
    let mut milestones = MilestoneTracker::restore(
        DelayRule {
            margin: config.delay_margin,
        },
        store.clone(),
    )?;
    for milestone in plan.resolve_milestones(&preview, &throughput, Utc::now())? {
        milestones.upsert_milestone(milestone);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let graph = Arc::new(RwLock::new(TaskGraph::new()));
        let mut scheduler = Scheduler::new(Arc::clone(&graph), config.registry())
            .with_policy(config.retry_policy())
            .with_config(config.scheduler_config())
            .with_throughput(Arc::new(RwLock::new(throughput)))
            .with_milestones(Arc::new(RwLock::new(milestones)))
            .with_store(store)
            .with_events(event_tx);

        for spec in plan.tasks {
            scheduler.add_task(spec.into_task()).await?;
        }

        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                print_event(&event);
            }
        });

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });

        let report = scheduler.run(cancel).await;
        drop(scheduler);
        let _ = printer.await;
        report
    })?;

    println!();
    print!("{}", report);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskStarted { task_id, agent_id } => {
            println!("  started   {} on {}", task_id, agent_id)
        }
        SchedulerEvent::TaskRetrying {
            task_id,
            attempt,
            delay,
            error_type,
            ..
        } => println!(
            "  retrying  {} (attempt {} in {:.1}s, {})",
            task_id,
            attempt,
            delay.as_secs_f64(),
            error_type
        ),
        SchedulerEvent::TaskCompleted { task_id, .. } => println!("  completed {}", task_id),
        SchedulerEvent::TaskFailed {
            task_id,
            error_type,
            error,
        } => println!("  failed    {} ({}): {}", task_id, error_type, error),
        SchedulerEvent::TaskBlocked { task_id, reason } => {
            println!("  blocked   {}: {}", task_id, reason)
        }
        SchedulerEvent::TaskInjected { task_id, parent } => {
            println!("  added     {} (from {})", task_id, parent)
        }
        SchedulerEvent::Milestone(event) => println!("  {}", event),
        SchedulerEvent::AllTasksComplete => println!("  all tasks finished"),
    }
}

fn run_estimate(config: &Config, plan_path: &Path) -> Result<()> {
    clog!("Estimate command: plan={}", plan_path.display());
    let plan = Plan::load(plan_path)?;
    let store = config.store()?;
    let throughput = load_throughput(config, &store);

    let graph = TaskGraph::from_tasks(plan.tasks.into_iter().map(|t| t.into_task()))?;
    let estimate = CriticalPathEstimator::new(config.simulation_tick_secs).estimate(
        &graph,
        &throughput,
        Utc::now(),
    )?;
    println!("{}", serde_json::to_string_pretty(&estimate)?);
    Ok(())
}

fn run_milestones(config: &Config) -> Result<()> {
    let store = config.store()?;
    let milestones = store.load_milestones()?;
    if milestones.is_empty() {
        println!("No milestones recorded in {}", store.dir().display());
        return Ok(());
    }
    for m in milestones {
        print!(
            "{:<20} {:<12} {:>5.1}%  due {}",
            m.name,
            m.status.to_string(),
            m.progress * 100.0,
            m.estimated_completion.format("%Y-%m-%d %H:%M")
        );
        if let Some(done) = m.actual_completion {
            print!("  done {}", done.format("%Y-%m-%d %H:%M"));
        }
        if let Some(reason) = &m.delay_reason {
            print!("  ({})", reason);
        }
        println!();
    }
    Ok(())
}

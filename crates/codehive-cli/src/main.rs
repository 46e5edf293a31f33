//! Codehive CLI - TDD cycles, instruction runs, snapshots and branches.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use codehive_core::config::STATE_DIR;
use codehive_core::{
    CodehiveConfig, EventBus, FeatureRequest, Phase, QueryStatus, Status, SystemClock,
    TestStatus,
};
use codehive_git::{BranchManager, LockTable, ShellRunner};
use codehive_orchestrator::{
    ChangeType, ExecutionQueue, ManualGenerator, PhaseOutcome, ProcessExecutor, TddCycleEngine,
    WorkspaceManager,
};
use codehive_store::{CycleStore, FileStore, HierarchyStore, RecordStore};
use colored::Colorize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "codehive", author, version)]
#[command(about = "Codehive - TDD cycle orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Codehive state in a project
    Init {
        /// Project root (defaults to current directory)
        path: Option<String>,
    },

    /// Drive a feature through RED, GREEN, REFACTOR and REVIEW
    Cycle {
        #[command(subcommand)]
        action: CycleCommands,
    },

    /// Run instructions through the configured executor
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Capture the project tree for a cycle
    Snapshot {
        /// Cycle ID
        cycle_id: String,

        /// Phase the snapshot belongs to (RED, GREEN, REFACTOR, REVIEW)
        #[arg(short, long, default_value = "RED")]
        phase: String,

        /// Branch recorded with the snapshot (defaults to the current branch)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// List snapshots
    Snapshots {
        /// Only snapshots of this cycle
        #[arg(short, long)]
        cycle: Option<String>,
    },

    /// Restore the project tree from a snapshot
    Restore {
        /// Snapshot ID
        snapshot_id: String,
    },

    /// Show changes in the current tree since a snapshot
    Changes {
        /// Cycle ID
        cycle_id: String,

        /// Snapshot to compare against
        #[arg(short, long)]
        since: Option<String>,
    },

    /// List paths changed by both cycles
    Conflicts {
        cycle_a: String,
        cycle_b: String,
    },

    /// Delete snapshots older than the retention window
    Cleanup {
        /// Retention in days (defaults to snapshots.retention_days)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Create or switch to a cycle's feature branch
    Branch {
        /// Cycle ID
        cycle_id: String,

        /// Feature title used for the branch slug
        title: String,
    },

    /// Stage everything and commit with the phase prefix
    Commit {
        /// Commit message
        message: String,

        /// Phase whose prefix is used
        #[arg(short, long, default_value = "RED")]
        phase: String,
    },

    /// Show hierarchy statistics for a project
    Stats {
        /// Project ID
        project_id: String,
    },

    /// Check .codehive/config.toml
    ValidateConfig,
}

#[derive(Subcommand)]
enum CycleCommands {
    /// Create a cycle and its feature branch
    Start {
        /// Project ID
        project_id: String,

        /// Feature title
        title: String,

        /// Acceptance criterion (repeatable)
        #[arg(short = 'c', long = "criterion")]
        criteria: Vec<String>,

        /// Feature description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Run the cycle's current phase
    Run {
        /// Cycle ID
        cycle_id: String,
    },

    /// Show phase, tests and open queries of a cycle
    Status {
        /// Cycle ID
        cycle_id: String,
    },

    /// List cycles
    List {
        /// Only cycles of this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Answer a pending query
    Answer {
        /// Query ID
        query_id: String,

        /// Answer text
        answer: String,
    },

    /// Record a test result reported by an external test run
    TestResult {
        /// Test ID
        test_id: String,

        #[arg(value_enum)]
        status: CliTestStatus,
    },

    /// Pause an active cycle
    Pause {
        /// Cycle ID
        cycle_id: String,
    },

    /// Resume a paused cycle
    Resume {
        /// Cycle ID
        cycle_id: String,
    },

    /// Mark a cycle failed
    Fail {
        /// Cycle ID
        cycle_id: String,

        /// Reason recorded with the failure
        reason: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Run a task's instructions in order, stopping at the first failure
    Run {
        /// Task ID
        task_id: String,

        /// Override queue.max_concurrent
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,
    },
}

/// CLI-friendly test status
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTestStatus {
    Passing,
    Failing,
    Skipped,
}

impl From<CliTestStatus> for TestStatus {
    fn from(status: CliTestStatus) -> Self {
        match status {
            CliTestStatus::Passing => TestStatus::Passing,
            CliTestStatus::Failing => TestStatus::Failing,
            CliTestStatus::Skipped => TestStatus::Skipped,
        }
    }
}

/// Find the project root by walking up to the nearest `.codehive` directory.
fn find_project_root() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        if current.join(STATE_DIR).is_dir() {
            return Ok(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(anyhow::anyhow!(
                    "No {} directory found. Run 'codehive init' first.",
                    STATE_DIR
                ));
            }
        }
    }
}

async fn open_records(root: &Path) -> Result<Arc<dyn RecordStore>> {
    let store = FileStore::open(root.join(STATE_DIR).join("records")).await?;
    Ok(Arc::new(store))
}

async fn open_workspace(root: &Path, config: &CodehiveConfig) -> Result<WorkspaceManager> {
    let cycles = CycleStore::new(open_records(root).await?);
    Ok(WorkspaceManager::new(
        root,
        config.snapshots.exclude.clone(),
        Arc::new(SystemClock),
    )
    .with_cycle_store(cycles))
}

fn branch_manager(root: &Path, config: &CodehiveConfig) -> BranchManager<ShellRunner> {
    let locks = Arc::new(LockTable::new(
        Arc::new(SystemClock),
        config.locks.ttl_millis(),
    ));
    BranchManager::new(
        ShellRunner::new(root, config.timeouts.git()),
        locks,
        config.git.clone(),
    )
}

/// Engine over the project's records; generation is left to the user
async fn open_engine(root: &Path, config: &CodehiveConfig) -> Result<TddCycleEngine<ShellRunner>> {
    let cycles = CycleStore::new(open_records(root).await?);
    let workspace = Arc::new(
        WorkspaceManager::new(
            root,
            config.snapshots.exclude.clone(),
            Arc::new(SystemClock),
        )
        .with_cycle_store(cycles.clone()),
    );
    let engine = TddCycleEngine::new(
        cycles,
        Arc::new(branch_manager(root, config)),
        workspace,
        Arc::new(ManualGenerator),
        EventBus::new(),
    )
    .with_ai_timeout(config.timeouts.ai());
    Ok(engine)
}

async fn run_cycle_command(action: CycleCommands) -> Result<()> {
    let root = find_project_root()?;
    let config = CodehiveConfig::load_or_default(&root)?;
    let engine = open_engine(&root, &config).await?;

    match action {
        CycleCommands::Start {
            project_id,
            title,
            criteria,
            description,
        } => {
            let mut request = FeatureRequest::new(project_id, title);
            request.description = description;
            for criterion in criteria {
                request = request.with_criterion(criterion);
            }

            let cycle = engine.start_cycle(request).await?;
            println!("{}", "✓ Cycle started".green().bold());
            println!("  ID:     {}", cycle.id.bright_cyan());
            println!("  Branch: {}", cycle.branch_name.unwrap_or_default());
            println!("  Phase:  {}", cycle.phase);
        }

        CycleCommands::Run { cycle_id } => match engine.execute_phase(&cycle_id).await? {
            PhaseOutcome::Completed {
                phase,
                next_phase,
                merge_request_url,
            } => {
                match next_phase {
                    Some(next) => println!(
                        "{} {} (next: {})",
                        "✓ Completed".green().bold(),
                        phase,
                        next
                    ),
                    None => println!("{}", "✓ Cycle completed".green().bold()),
                }
                if let Some(url) = merge_request_url {
                    println!("  Merge request: {}", url.bright_cyan());
                }
            }
            PhaseOutcome::Blocked { queries } => {
                println!(
                    "{}",
                    format!("Blocked on {} query(ies):", queries.len()).yellow().bold()
                );
                for query in queries {
                    println!("  {} {}", query.id.bright_cyan(), query.question);
                }
            }
            PhaseOutcome::Failed {
                next_phase,
                failing_tests,
            } => {
                println!(
                    "{} back to {}",
                    "✗ Review failed,".red().bold(),
                    next_phase
                );
                for name in failing_tests {
                    println!("  {}", name);
                }
            }
        },

        CycleCommands::Status { cycle_id } => {
            let details = engine.get_cycle_details(&cycle_id).await?;
            let cycle = &details.cycle;
            println!("{} {}", cycle.id.bright_cyan(), cycle.title.bold());
            println!("  Phase:  {} ({})", cycle.phase, cycle.status);
            if let Some(branch) = &cycle.branch_name {
                println!("  Branch: {}", branch);
            }
            if let Some(url) = &cycle.merge_request_url {
                println!("  Merge request: {}", url);
            }

            println!("  Tests:");
            for test in &details.tests {
                let marker = match test.status {
                    TestStatus::Passing => "✓".green(),
                    TestStatus::Failing => "✗".red(),
                    TestStatus::Skipped => "-".yellow(),
                };
                println!("    {} {} {}", marker, test.name, test.id.dimmed());
            }

            let pending: Vec<_> = details
                .queries
                .iter()
                .filter(|q| q.status == QueryStatus::Pending)
                .collect();
            if !pending.is_empty() {
                println!("  Pending queries:");
                for query in pending {
                    println!("    {} {}", query.id.bright_cyan(), query.question);
                }
            }
        }

        CycleCommands::List { project } => {
            let cycles = engine.list_cycles(project.as_deref()).await?;
            if cycles.is_empty() {
                println!("{}", "No cycles found".yellow());
                return Ok(());
            }
            for cycle in cycles {
                println!(
                    "{:<10} {:<10} {:<10} {}",
                    cycle.id.bright_cyan(),
                    cycle.phase.to_string(),
                    cycle.status.to_string(),
                    cycle.title
                );
            }
        }

        CycleCommands::Answer { query_id, answer } => {
            let query = engine.answer_query(&query_id, &answer).await?;
            println!("{} {}", "✓ Answered".green().bold(), query.id.bright_cyan());
        }

        CycleCommands::TestResult { test_id, status } => {
            let test = engine.record_test_result(&test_id, status.into()).await?;
            println!("{} {} is {:?}", "✓".green().bold(), test.name, test.status);
        }

        CycleCommands::Pause { cycle_id } => {
            let cycle = engine.pause_cycle(&cycle_id).await?;
            println!("{} {}", "✓ Paused".green().bold(), cycle.id.bright_cyan());
        }

        CycleCommands::Resume { cycle_id } => {
            let cycle = engine.resume_cycle(&cycle_id).await?;
            println!("{} {}", "✓ Resumed".green().bold(), cycle.id.bright_cyan());
        }

        CycleCommands::Fail { cycle_id, reason } => {
            let cycle = engine.fail_cycle(&cycle_id, &reason).await?;
            println!("{} {}", "✗ Failed".red().bold(), cycle.id.bright_cyan());
        }
    }
    Ok(())
}

async fn run_queue_command(action: QueueCommands) -> Result<()> {
    let root = find_project_root()?;
    let config = CodehiveConfig::load_or_default(&root)?;

    match action {
        QueueCommands::Run {
            task_id,
            max_concurrent,
        } => {
            let hierarchy = Arc::new(HierarchyStore::new(
                open_records(&root).await?,
                EventBus::new(),
            ));
            let executor = Arc::new(ProcessExecutor::from_config(&config, root.clone()));
            let queue = ExecutionQueue::new(
                hierarchy,
                executor,
                max_concurrent.unwrap_or(config.queue.max_concurrent),
            );

            let report = queue.execute_task(&task_id).await?;
            for run in &report.instructions {
                let marker = if run.is_completed() {
                    "✓".green()
                } else {
                    "✗".red()
                };
                println!(
                    "  {} {} ({} ms, {} tokens)",
                    marker, run.instruction_id, run.execution_time_ms, run.token_usage
                );
                if let Some(error) = &run.error {
                    println!("    {}", error.red());
                }
            }
            if report.skipped > 0 {
                println!("  {} already completed", report.skipped);
            }
            if report.status != Status::Completed {
                return Err(anyhow::anyhow!(
                    "Task {} stopped at a failed instruction",
                    task_id
                ));
            }
            println!("{} {}", "✓ Task completed".green().bold(), task_id.bright_cyan());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Codehive CLI starting");

    match cli.command {
        Commands::Init { path } => {
            let root = PathBuf::from(path.unwrap_or_else(|| ".".to_string()));
            let config = CodehiveConfig::load_or_default(&root)?;

            let workspace = open_workspace(&root, &config).await?;
            workspace.initialize().await?;

            let config_path = root.join(STATE_DIR).join("config.toml");
            if !config_path.exists() {
                CodehiveConfig::write_default(&root)?;
            }

            println!("{}", "✓ Initialized codehive".green().bold());
            println!("  State:  {}", root.join(STATE_DIR).display());
            println!("  Config: {}", config_path.display());
            Ok(())
        }

        Commands::Cycle { action } => run_cycle_command(action).await,

        Commands::Queue { action } => run_queue_command(action).await,

        Commands::Snapshot {
            cycle_id,
            phase,
            branch,
        } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let phase: Phase = phase.parse()?;

            let branch = match branch {
                Some(branch) => branch,
                None => {
                    let current = branch_manager(&root, &config).current_branch().await;
                    if current.success {
                        current.output
                    } else {
                        "HEAD".to_string()
                    }
                }
            };

            let workspace = open_workspace(&root, &config).await?;
            let snapshot = workspace.create_snapshot(&cycle_id, &branch, phase).await?;

            println!("{}", "✓ Snapshot created".green().bold());
            println!("  ID:     {}", snapshot.id.bright_cyan());
            println!("  Branch: {}", snapshot.branch_name);
            println!("  Files:  {}", snapshot.files.len());
            Ok(())
        }

        Commands::Snapshots { cycle } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let workspace = open_workspace(&root, &config).await?;

            let snapshots = workspace.list_snapshots(cycle.as_deref()).await?;
            if snapshots.is_empty() {
                println!("{}", "No snapshots found".yellow());
                return Ok(());
            }

            println!(
                "{:<44} {:<10} {:<8} {}",
                "ID".bold(),
                "PHASE".bold(),
                "FILES".bold(),
                "CREATED".bold()
            );
            println!("{}", "─".repeat(90));
            for snapshot in snapshots {
                println!(
                    "{:<44} {:<10} {:<8} {}",
                    snapshot.id.bright_cyan(),
                    snapshot.phase.to_string(),
                    snapshot.files.len(),
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }

        Commands::Restore { snapshot_id } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let workspace = open_workspace(&root, &config).await?;

            let snapshot = workspace.restore_snapshot(&snapshot_id).await?;
            println!(
                "{} {} ({} files)",
                "✓ Restored".green().bold(),
                snapshot.id.bright_cyan(),
                snapshot.files.len()
            );
            Ok(())
        }

        Commands::Changes { cycle_id, since } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let workspace = open_workspace(&root, &config).await?;

            let changes = workspace
                .analyze_changes(&cycle_id, since.as_deref())
                .await?;
            if changes.is_empty() {
                println!("{}", "No changes".yellow());
                return Ok(());
            }

            for change in changes {
                let marker = match change.change_type {
                    ChangeType::Create => "A".green(),
                    ChangeType::Modify => "M".yellow(),
                    ChangeType::Delete => "D".red(),
                };
                println!("{} {}", marker, change.path);
            }
            Ok(())
        }

        Commands::Conflicts { cycle_a, cycle_b } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let workspace = open_workspace(&root, &config).await?;

            let conflicts = workspace.detect_conflicts(&cycle_a, &cycle_b).await?;
            if conflicts.is_empty() {
                println!("{}", "✓ No conflicting paths".green());
                return Ok(());
            }

            println!(
                "{}",
                format!("{} conflicting path(s):", conflicts.len()).red().bold()
            );
            for path in conflicts {
                println!("  {}", path);
            }
            Ok(())
        }

        Commands::Cleanup { days } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let workspace = open_workspace(&root, &config).await?;

            let days = days.unwrap_or(config.snapshots.retention_days);
            let removed = workspace.cleanup_old_snapshots(days).await?;
            println!(
                "{} {} snapshot(s) older than {} days",
                "✓ Removed".green().bold(),
                removed,
                days
            );
            Ok(())
        }

        Commands::Branch { cycle_id, title } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;

            let result = branch_manager(&root, &config)
                .create_feature_branch(&cycle_id, &title)
                .await;
            if !result.success {
                return Err(anyhow::anyhow!(
                    "Branch failed: {}",
                    result.error.unwrap_or_default()
                ));
            }
            println!("{} {}", "✓ On branch".green().bold(), result.output.bright_cyan());
            Ok(())
        }

        Commands::Commit { message, phase } => {
            let root = find_project_root()?;
            let config = CodehiveConfig::load_or_default(&root)?;
            let phase: Phase = phase.parse()?;

            let result = branch_manager(&root, &config)
                .commit_changes(&message, phase)
                .await;
            if !result.success {
                return Err(anyhow::anyhow!(
                    "Commit failed: {}",
                    result.error.unwrap_or_default()
                ));
            }
            println!("{} {}", "✓ Committed".green().bold(), result.output.bright_cyan());
            Ok(())
        }

        Commands::Stats { project_id } => {
            let root = find_project_root()?;
            let hierarchy = HierarchyStore::new(open_records(&root).await?, EventBus::new());

            let stats = hierarchy.get_hierarchy_statistics(&project_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }

        Commands::ValidateConfig => {
            let root = find_project_root()?;
            match CodehiveConfig::load_or_default(&root) {
                Ok(config) => {
                    println!("{}", "✓ Configuration is valid".green().bold());
                    println!("  Max concurrent: {}", config.queue.max_concurrent);
                    println!("  Lock TTL:       {} min", config.locks.ttl_minutes);
                    println!("  Executor:       {}", config.executor.program);
                    println!("  AI timeout:     {} s", config.timeouts.ai_secs);
                    Ok(())
                }
                Err(e) => Err(anyhow::anyhow!("Invalid configuration: {}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_author_is_the_project() {
        let command = Cli::command();
        assert_eq!(command.get_author(), Some("Codehive Developers"));
        assert_eq!(command.get_version(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_cycle_start_collects_criteria() {
        let cli = Cli::try_parse_from([
            "codehive",
            "cycle",
            "start",
            "p1",
            "User Login",
            "-c",
            "accepts valid password",
            "--criterion",
            "rejects wrong password",
        ])
        .unwrap();

        match cli.command {
            Commands::Cycle {
                action:
                    CycleCommands::Start {
                        project_id,
                        title,
                        criteria,
                        description,
                    },
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(title, "User Login");
                assert_eq!(criteria, vec!["accepts valid password", "rejects wrong password"]);
                assert!(description.is_empty());
            }
            _ => panic!("expected cycle start"),
        }
    }

    #[test]
    fn test_test_result_status_values() {
        let cli = Cli::try_parse_from(["codehive", "cycle", "test-result", "t1", "passing"]).unwrap();
        match cli.command {
            Commands::Cycle {
                action: CycleCommands::TestResult { test_id, status },
            } => {
                assert_eq!(test_id, "t1");
                assert_eq!(TestStatus::from(status), TestStatus::Passing);
            }
            _ => panic!("expected test-result"),
        }

        assert!(Cli::try_parse_from(["codehive", "cycle", "test-result", "t1", "green"]).is_err());
    }

    #[test]
    fn test_queue_run_overrides_concurrency() {
        let cli = Cli::try_parse_from(["codehive", "queue", "run", "task-1", "-j", "5"]).unwrap();
        match cli.command {
            Commands::Queue {
                action:
                    QueueCommands::Run {
                        task_id,
                        max_concurrent,
                    },
            } => {
                assert_eq!(task_id, "task-1");
                assert_eq!(max_concurrent, Some(5));
            }
            _ => panic!("expected queue run"),
        }
    }
}

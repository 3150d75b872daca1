use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cadence::config::{CadenceConfig, LoggingConfig};
use cadence::scheduler::{cron, Dispatch};

#[derive(Parser)]
#[command(
    name = "cadence",
    about = "Cron-driven scheduler for automated test tasks",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (timer loop + executor)
    Serve,

    /// Check whether a trigger expression is well formed
    Validate {
        /// 5- or 6-field cron expression
        expression: String,
    },

    /// Print the next fire time of a trigger expression
    Next {
        expression: String,

        /// Compute from this RFC 3339 instant instead of now
        #[arg(long)]
        after: Option<String>,
    },

    /// Run a task immediately and wait for the batch to finish
    Run {
        task_id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Mark a running task as stopped
    Stop { task_id: i64 },

    /// Show a task's status and last outcome
    Status { task_id: i64 },

    /// Success rate and average duration over a trailing window
    Stats {
        task_id: i64,

        /// Window length in days
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// List a task's most recent reports
    History {
        task_id: i64,

        /// Number of reports to show (0 = all)
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// List armed jobs and their next fire times
    Jobs,

    /// Preview what will fire in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CadenceConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(db_path = %config.database.path, "Starting cadence daemon");
            cadence::serve(&config).await?;
        }
        Commands::Validate { expression } => {
            if cron::validate(&expression) {
                println!("valid");
            } else {
                println!("invalid");
                std::process::exit(1);
            }
        }
        Commands::Next { expression, after } => {
            let after = match after {
                Some(s) => DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc),
                None => Utc::now(),
            };
            let next = cron::next_fire_time(&expression, after)?;
            println!("{}", next.to_rfc3339());
        }
        Commands::Run { task_id, json } => {
            let scheduler = cadence::build_scheduler(&config)?;
            match scheduler.run_now(task_id).await? {
                Dispatch::AlreadyRunning => {
                    println!("Task {} is already running, skipped.", task_id);
                }
                Dispatch::Started(handle) => {
                    let Some(outcome) = handle.wait().await else {
                        anyhow::bail!("batch for task {} aborted, see log", task_id);
                    };
                    if json {
                        println!("{}", serde_json::to_string_pretty(&outcome)?);
                    } else {
                        println!("\nTask {} batch {}", task_id, outcome.batch_id);
                        println!("{:<40} | {:<8} | Duration", "Case", "Status");
                        println!("{:-<40}-|-{:-<8}-|-{:-<10}", "", "", "");
                        for r in &outcome.results {
                            println!(
                                "{:<40} | {:<8} | {:.2}s",
                                r.name,
                                r.status.as_str(),
                                r.duration_secs()
                            );
                            if let Some(err) = &r.error {
                                println!("{:<40} | {:<8} |   -> {}", "", "", err);
                            }
                        }
                        let s = &outcome.summary;
                        println!(
                            "\n{}: {} total, {} passed, {} failed, {} skipped ({:.1}%) in {}",
                            outcome.status.as_str().to_uppercase(),
                            s.total,
                            s.passed,
                            s.failed,
                            s.skipped,
                            s.pass_rate,
                            outcome.duration_text()
                        );
                    }
                }
            }
        }
        Commands::Stop { task_id } => {
            let scheduler = cadence::build_scheduler(&config)?;
            scheduler.stop(task_id).await?;
            println!("Task {} stopped.", task_id);
        }
        Commands::Status { task_id } => {
            let scheduler = cadence::build_scheduler(&config)?;
            let view = scheduler.get_status(task_id).await?;
            println!("Task:         {}", view.task_id);
            println!("Status:       {}", view.status);
            println!("Scheduled:    {}", view.scheduled);
            match (view.last_outcome, view.last_run_at) {
                (Some(outcome), Some(at)) => {
                    println!("Last outcome: {} at {}", outcome.as_str(), at.to_rfc3339())
                }
                _ => println!("Last outcome: never run"),
            }
        }
        Commands::Stats { task_id, days } => {
            let scheduler = cadence::build_scheduler(&config)?;
            let stats = scheduler.get_stats(task_id, days).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::History { task_id, limit } => {
            let scheduler = cadence::build_scheduler(&config)?;
            let reports = scheduler.history(task_id, limit).await?;
            if reports.is_empty() {
                println!("No reports found.");
            } else {
                println!(
                    "{:<6} | {:<25} | {:<7} | {:<6} | {:<6} | Duration",
                    "ID", "Finished", "Status", "Passed", "Failed"
                );
                println!("{:-<6}-|-{:-<25}-|-{:-<7}-|-{:-<6}-|-{:-<6}-|-{:-<8}", "", "", "", "", "", "");
                for r in reports {
                    println!(
                        "{:<6} | {:<25} | {:<7} | {:<6} | {:<6} | {}",
                        r.id,
                        r.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        r.status.as_str(),
                        r.passed,
                        r.failure,
                        r.run_time
                    );
                }
            }
        }
        Commands::Jobs => {
            let scheduler = cadence::build_scheduler(&config)?;
            scheduler.registry().load_all().await?;
            let jobs = scheduler.jobs().await;
            if jobs.is_empty() {
                println!("No scheduled tasks.");
            } else {
                println!("{:<6} | {:<20} | {:<18} | Next fire", "Task", "Name", "Cron");
                println!("{:-<6}-|-{:-<20}-|-{:-<18}-|-{:-<25}", "", "", "", "");
                for j in jobs {
                    println!(
                        "{:<6} | {:<20} | {:<18} | {}",
                        j.task_id,
                        j.task_name,
                        j.cron_expr,
                        j.next_fire.to_rfc3339()
                    );
                }
            }
        }
        Commands::DryRun { hours } => {
            let scheduler = cadence::build_scheduler(&config)?;
            scheduler.registry().load_all().await?;
            let fires = scheduler.preview(hours).await;
            if fires.is_empty() {
                println!("Nothing fires in the next {} hours.", hours);
            } else {
                println!("Dry run for the next {} hours:", hours);
                for (at, job) in fires {
                    println!(
                        "  {} -> task {} ({})",
                        at.format("%Y-%m-%d %H:%M:%S UTC"),
                        job.task_id,
                        job.task_name
                    );
                }
            }
        }
    }

    Ok(())
}

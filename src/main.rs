//! SOVRA Agent - Entry Point
//!
//! Reads one command per line from stdin:
//! - `<text>`: route and answer
//! - `goal <description>`: run a goal, report when it finishes
//! - `abort <goal-id>`, `status`, `reload`, `evolve`
//! - `schedule <name> | <cron> | <goal>`, `unschedule <name>`
//! - `feedback <interaction-id> <score> [comment]`
//! - `quit`
//!
//! SIGHUP reloads the policy file.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sovra_agent::router::Request;
use sovra_agent::{Config, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::from_env()?;

    // Logs go to stderr; stdout carries answers
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    info!("SOVRA Agent v{}", env!("CARGO_PKG_VERSION"));

    let runtime = Arc::new(Runtime::from_config(&config)?);
    runtime.start().await?;
    spawn_reload_on_hangup(runtime.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Ready, waiting for input...");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed (EOF)");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    break;
                }
                handle_line(&runtime, line).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    runtime.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

async fn handle_line(runtime: &Arc<Runtime>, line: &str) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "goal" if !rest.is_empty() => match runtime.supervisor.submit(rest) {
            Ok(handle) => {
                println!("goal {} queued", handle.goal_id);
                tokio::spawn(async move {
                    let goal_id = handle.goal_id.clone();
                    match handle.wait().await {
                        Some(report) => {
                            println!("goal {} {}", goal_id, report.outcome.describe());
                            for lesson in &report.lessons {
                                println!("  lesson [{}]: {}", lesson.category.as_str(), lesson.summary);
                            }
                        }
                        None => warn!(goal_id = %goal_id, "Goal dropped without a report"),
                    }
                });
            }
            Err(e) => println!("error: {}", e),
        },
        "abort" if !rest.is_empty() => {
            if runtime.supervisor.abort(rest) {
                println!("abort requested for {}", rest);
            } else {
                println!("no active goal {}", rest);
            }
        }
        "status" => match serde_json::to_string_pretty(&runtime.status()) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to render status: {}", e),
        },
        "reload" => match runtime.reload_policy() {
            Ok(generation) => println!("policy generation {} active", generation),
            Err(e) => println!("reload rejected: {}", e),
        },
        "evolve" => {
            let pipeline = runtime.evolution.clone();
            tokio::spawn(async move {
                match pipeline.run_cycle().await {
                    Ok(run) => println!("evolution run {} {}", run.id, run.state.as_str()),
                    Err(e) => println!("evolution not started: {}", e),
                }
            });
        }
        "schedule" => {
            let parts: Vec<&str> = rest.splitn(3, '|').map(str::trim).collect();
            match parts.as_slice() {
                [name, cron, goal] if !name.is_empty() && !goal.is_empty() => {
                    match runtime.scheduler.add_dynamic_job(name, goal, cron, Utc::now()) {
                        Ok(()) => println!("job {} scheduled", name),
                        Err(e) => println!("error: {}", e),
                    }
                }
                _ => println!("usage: schedule <name> | <cron> | <goal>"),
            }
        }
        "unschedule" if !rest.is_empty() => match runtime.scheduler.remove_job(rest) {
            Ok(true) => println!("job {} removed", rest),
            Ok(false) => println!("no job {}", rest),
            Err(e) => println!("error: {}", e),
        },
        "feedback" => {
            let mut parts = rest.splitn(3, ' ');
            let id = parts.next().unwrap_or_default();
            let score = parts.next().and_then(|s| s.parse::<f64>().ok());
            let comment = parts.next();
            match (id, score) {
                (id, Some(score)) if !id.is_empty() => match runtime.interactions.feedback(id, comment, Some(score)) {
                    Ok(true) => println!("feedback recorded"),
                    Ok(false) => println!("no interaction {}", id),
                    Err(e) => println!("error: {}", e),
                },
                _ => println!("usage: feedback <interaction-id> <score> [comment]"),
            }
        }
        _ => match runtime.router.dispatch(&Request::new(line)).await {
            Ok(response) => {
                println!("{}", response.text);
                info!(
                    interaction_id = %response.interaction_id,
                    served_by = response.served_by.as_str(),
                    "Answered"
                );
            }
            Err(e) => println!("error: {}", e),
        },
    }
}

#[cfg(unix)]
fn spawn_reload_on_hangup(runtime: Arc<Runtime>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match runtime.reload_policy() {
                Ok(generation) => info!(generation, "Policy reloaded on SIGHUP"),
                Err(e) => warn!("Policy reload on SIGHUP rejected: {}", e),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_runtime: Arc<Runtime>) -> Result<()> {
    Ok(())
}

fn print_help() {
    println!("SOVRA Agent v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: sovra-agent [--help]");
    println!();
    println!("Reads commands from stdin, one per line:");
    println!("  <text>                              Route and answer");
    println!("  goal <description>                  Plan and execute a goal");
    println!("  abort <goal-id>                     Abort a queued or running goal");
    println!("  status                              Runtime status as JSON");
    println!("  reload                              Reload the policy file");
    println!("  evolve                              Start a self-evolution run");
    println!("  schedule <name> | <cron> | <goal>   Schedule a recurring goal");
    println!("  unschedule <name>                   Remove a scheduled job");
    println!("  feedback <id> <score> [comment]     Rate an answer");
    println!("  quit                                Exit");
    println!();
    println!("Environment variables:");
    println!("  SOVRA_DATA_DIR              Data directory");
    println!("  SOVRA_DB_PATH               SQLite database (default: <data>/sovra.db)");
    println!("  SOVRA_POLICY_PATH           Policy TOML (default: <data>/policy.toml)");
    println!("  OLLAMA_URL                  Local model server");
    println!("  SOVRA_MODEL                 Base model");
    println!("  SOVRA_EXTERNAL_URL          External model server (optional)");
    println!("  SOVRA_EXTERNAL_MODEL        External model name");
    println!("  SOVRA_EXTERNAL_DAILY_LIMIT  External calls per day");
    println!("  SOVRA_TRAIN_CMD / SOVRA_MERGE_CMD / SOVRA_EVAL_CMD  Trainer commands");
    println!("  SOVRA_AUTO_APPROVE          Approve confirmations without asking");
    println!("  SOVRA_LOG_JSON              JSON logs on stderr");
    println!("  RUST_LOG                    Log filter");
}

use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};
use colored::Colorize;
use download_engine::{
    DownloadManager, DownloadRequest, DownloadTask, EngineConfig, TaskId, TaskState,
    utils::{format_bytes, format_speed},
};
use tokio::time::sleep;
use tracing::{Level, debug, error, info};
use utils::logging::{self, Component, LogConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set download directory
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Set output filename (single URL only)
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: Option<String>,

    /// Download at most N files at once
    #[arg(short = 'c', long = "max-concurrent", value_name = "N")]
    max_concurrent: Option<usize>,

    /// Config file location
    #[arg(long = "config", value_name = "FILE", default_value = "riptide.toml")]
    config: PathBuf,

    /// Give up on an attempt after SECS seconds
    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Skip the size check after a download finishes
    #[arg(long = "no-verify", action = ArgAction::SetTrue)]
    no_verify: bool,

    /// Keep partially downloaded files when cancelling
    #[arg(long = "keep-partial", action = ArgAction::SetTrue)]
    keep_partial: bool,

    /// Set log level
    #[arg(long = "log-level", value_name = "LEVEL",
          value_parser = ["trace", "debug", "info", "warn", "error"],
          default_value = "info")]
    log_level: String,

    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Initialize logging
    match logging::init_logging(LogConfig {
        max_level: match cli.log_level.as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => {
                eprintln!(
                    "invalid log level in arguments, use of of the [\"trace\", \"debug\", \"info\", \"warn\", \"error\"]"
                );
                Level::INFO
            }
        },
        ..logging::get_cli_config(".dev/logs")
    }) {
        Ok(_) => {
            debug!("Logger initialized for {}", Component::Riptide.as_str());
        }
        Err(e) => {
            eprintln!("Failed to initialize logger: {}", e);
        }
    }

    let mut config = match EngineConfig::load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            EngineConfig::default()
        }
    };
    if let Some(dir) = &cli.dir {
        config.download_dir = dir.clone();
    }
    if let Some(limit) = cli.max_concurrent {
        config.max_concurrent_downloads = limit;
    }
    if let Some(secs) = cli.timeout {
        config.attempt_timeout_in_secs = Some(secs);
    }
    if cli.no_verify {
        config.verify_size = false;
    }
    if cli.keep_partial {
        config.remove_file_on_cancel = false;
    }

    let manager = DownloadManager::new(config);

    match manager.load_cached_tasks().await {
        Ok(found) if found > 0 => info!("found {} earlier download(s) on disk", found),
        Ok(_) => {}
        Err(e) => error!("Failed to scan download directory: {}", e),
    }

    let out = if cli.urls.len() == 1 {
        cli.out.clone()
    } else {
        if cli.out.is_some() {
            eprintln!("--out ignored with more than one URL");
        }
        None
    };

    let known = manager.list().await?;
    let mut watched: Vec<TaskId> = Vec::new();
    for url in cli.urls {
        let id = TaskId::from_url(&url);
        if let Some(task) = known.iter().find(|task| task.id == id) {
            if task.state == TaskState::Completed {
                println!("{} is already complete, skipping", task.file_name.green());
                continue;
            }
        }

        let mut request = DownloadRequest::new(url);
        request.file_name = out.clone();
        let task = manager.enqueue(request).await?;
        watched.push(task.id);
    }
    if watched.is_empty() {
        return Ok(());
    }

    let tasks = manager.tasks();
    let mut notices = manager.notices();
    println!("{}", "\n".repeat(4 * watched.len()));

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = sleep(Duration::from_millis(250)) => {}
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    info!("{}: {}", notice.file_name, notice.message);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                info!("interrupt received, cancelling downloads");
                manager.cancel_all().await?;
            }
        }

        let snapshot: Vec<DownloadTask> = {
            let all = tasks.borrow();
            watched
                .iter()
                .filter_map(|id| all.iter().find(|task| task.id == *id).cloned())
                .collect()
        };
        pretty_print_progress(&snapshot);

        if snapshot.iter().all(|task| task.state.is_terminal()) {
            let mut failed = 0;
            for task in &snapshot {
                if let TaskState::Failed(reason) = &task.state {
                    failed += 1;
                    eprintln!("{}: {}", task.file_name.red(), reason);
                }
            }
            if failed > 0 {
                std::process::exit(1);
            }
            break;
        }
    }

    Ok(())
}

fn pretty_print_progress(tasks: &[DownloadTask]) {
    println!("\x1B[{}A", (tasks.len() * 4) + 2);
    for (index, task) in tasks.iter().enumerate() {
        let filename = short_name(&task.file_name);
        let status = match &task.state {
            TaskState::Pending => "Pending".bright_black(),
            TaskState::Preparing => "Preparing".blue(),
            TaskState::Downloading => "Downloading".blue(),
            TaskState::Paused => "Paused".yellow(),
            TaskState::Completed => "Completed".green(),
            TaskState::Failed(_) => "Failed".red(),
            TaskState::Cancelled => "Cancelled".red(),
            TaskState::IncompleteDownloadDetected => "Incomplete".yellow(),
        };
        println!(
            "\n\t\x1B[K {}. {} {}{}",
            index + 1,
            filename,
            " ".repeat(50usize.saturating_sub(4 + filename.chars().count() + status.chars().count())),
            status,
        );
        let downloaded = format_bytes(task.downloaded_bytes);
        let total = match task.total_bytes {
            Some(total) => format_bytes(total),
            None => "?".to_string(),
        };
        let percentage = match task.total_bytes {
            Some(_) => format!("{}%", task.progress),
            None => "--".to_string(),
        };
        let speed = format_speed(task.speed);
        let eta = match (&task.state, task.total_bytes) {
            (TaskState::Completed, _) => "0s".to_string(),
            (_, Some(total)) if task.speed > 0 => {
                format!("{}s", total.saturating_sub(task.downloaded_bytes) / task.speed)
            }
            _ => "∞".to_string(),
        };
        println!(
            "\t\x1B[K [{}/{}({}) Speed:{} ETA:{}]\r",
            downloaded,
            total,
            percentage.blue(),
            speed.green(),
            eta.yellow(),
        );
        print_progress_string(task.progress, 50);
    }
    println!();
}

/// Shorten a display name to 35 characters. Counts chars, not bytes, so
/// multi-byte names never split inside a code point.
fn short_name(file_name: &str) -> String {
    if file_name.chars().count() > 35 {
        let head: String = file_name.chars().take(32).collect();
        format!("{}...", head)
    } else {
        file_name.to_string()
    }
}

fn print_progress_string(progress: u8, width: usize) {
    let filled = width * usize::from(progress.min(100)) / 100;
    println!(
        "\t {}{}",
        "━".repeat(filled).green(),
        "━".repeat(width - filled).bright_black()
    )
}

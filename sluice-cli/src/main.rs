mod progress;

use std::collections::HashSet;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use playlist::HttpPlaylistResolver;
use sluice::{
    DownloadEvent, DownloadOptions, DownloadService, PlaylistResolver, ServiceConfig, TaskStatus,
    WorkerConfig, parse_batch_input,
};
use tokio::sync::broadcast;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::progress::ProgressRenderer;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Segmented media downloader built on ffmpeg")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a single stream
    Get {
        /// Playlist or media URL
        url: String,

        /// Directory the output file is written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Output file name; derived from the URL when omitted
        #[arg(short = 'n', long)]
        file_name: Option<String>,

        /// Parallel download limit (1-10)
        #[arg(short = 'c', long)]
        max_concurrent: Option<usize>,

        /// Worker binary to launch
        #[arg(long, default_value = "ffmpeg")]
        worker: String,

        /// User-Agent header the worker sends
        #[arg(long)]
        user_agent: Option<String>,
    },
    /// Download a list of `<url> ---- <file name>` lines
    Batch {
        /// Input file, or `-` to read stdin
        input: String,

        /// Directory the output files are written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Parallel download limit (1-10)
        #[arg(short = 'c', long)]
        max_concurrent: Option<usize>,

        /// Worker binary to launch
        #[arg(long, default_value = "ffmpeg")]
        worker: String,

        /// User-Agent header the worker sends
        #[arg(long)]
        user_agent: Option<String>,
    },
    /// Resolve a playlist and report its totals without downloading
    Probe {
        /// Playlist URL
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        // Progress bars carry the per-task story; keep the log channel for
        // problems unless RUST_LOG says otherwise.
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Get {
            url,
            output_dir,
            file_name,
            max_concurrent,
            worker,
            user_agent,
        } => {
            let service = build_service(worker, user_agent);
            let file_name = match file_name {
                Some(name) => name,
                None => derive_file_name(&url),
            };
            let rx = service.subscribe();
            let renderer_rx = service.subscribe();
            tokio::spawn(ProgressRenderer::new().run(renderer_rx));
            service.start();

            let id = service.download(&url, output_dir, file_name, options_from(max_concurrent))?;
            drive_to_completion(&service, rx, vec![id]).await
        }

        Commands::Batch {
            input,
            output_dir,
            max_concurrent,
            worker,
            user_agent,
        } => {
            let text = read_input(&input)?;
            let items = parse_batch_input(&text)?;
            if items.is_empty() {
                bail!("no downloads listed in {input}");
            }

            let service = build_service(worker, user_agent);
            let rx = service.subscribe();
            let renderer_rx = service.subscribe();
            tokio::spawn(ProgressRenderer::new().run(renderer_rx));
            service.start();

            let ids = service.download_batch(items, output_dir, options_from(max_concurrent));
            if ids.is_empty() {
                bail!("no valid URLs in {input}");
            }
            drive_to_completion(&service, rx, ids).await
        }

        Commands::Probe { url } => probe(&url).await,
    }
}

fn options_from(max_concurrent: Option<usize>) -> DownloadOptions {
    match max_concurrent {
        Some(max) => DownloadOptions::default().with_max_concurrent(max),
        None => DownloadOptions::default(),
    }
}

fn build_service(worker: String, user_agent: Option<String>) -> DownloadService {
    let mut worker_config = WorkerConfig::default().with_binary_path(worker);
    if let Some(ua) = user_agent {
        worker_config = worker_config.with_user_agent(ua);
    }
    DownloadService::with_config(ServiceConfig::default().with_worker(worker_config))
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read {input}"))
    }
}

/// Wait for every task to reach a terminal state, then summarize. Ctrl-C
/// cancels everything still running and exits 130.
async fn drive_to_completion(
    service: &DownloadService,
    rx: broadcast::Receiver<DownloadEvent>,
    ids: Vec<String>,
) -> Result<()> {
    let failed = tokio::select! {
        failed = wait_for_terminal(service, rx, &ids) => failed,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, cancelling downloads");
            service.shutdown().await;
            process::exit(130);
        }
    };
    service.shutdown().await;

    let completed = ids.len() - failed.len();
    println!("{completed} completed, {} failed", failed.len());
    for task_id in &failed {
        if let Some(task) = service.task(task_id) {
            let reason = task.error_message.as_deref().unwrap_or(task.status.as_str());
            eprintln!("  {}: {reason}", task.file_name);
        }
    }
    if !failed.is_empty() {
        process::exit(1);
    }
    Ok(())
}

/// Returns the ids that did not complete. The receiver predates the first
/// enqueue, so no terminal event can be missed; a lagged receiver falls back
/// to registry snapshots.
async fn wait_for_terminal(
    service: &DownloadService,
    mut rx: broadcast::Receiver<DownloadEvent>,
    ids: &[String],
) -> Vec<String> {
    let mut pending: HashSet<String> = ids.iter().cloned().collect();
    let mut failed = Vec::new();

    while !pending.is_empty() {
        match rx.recv().await {
            Ok(event) => {
                if !pending.contains(event.task_id()) {
                    continue;
                }
                match event.kind() {
                    "completed" => {
                        pending.remove(event.task_id());
                    }
                    "failed" | "cancelled" | "removed" => {
                        pending.remove(event.task_id());
                        failed.push(event.task_id().to_string());
                    }
                    _ => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                pending.retain(|id| {
                    match service.task(id) {
                        Some(task) if task.is_terminal() => {
                            if task.status != TaskStatus::Completed {
                                failed.push(id.clone());
                            }
                            false
                        }
                        Some(_) => true,
                        None => false,
                    }
                });
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    failed
}

async fn probe(url: &str) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["-", "\\", "|", "/", "-"]),
    );
    pb.set_message(format!("Probing {url}"));

    let resolver = HttpPlaylistResolver::new();
    let result = resolver.probe(url).await;
    pb.finish_and_clear();

    let summary = result?;
    println!("segments: {}", summary.segment_count);
    println!("duration: {:.1}s", summary.total_duration_secs);
    Ok(())
}

/// Last path segment of the URL, with playlist extensions swapped for `.ts`.
fn derive_file_name(url: &str) -> String {
    let base = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
                .map(str::to_string)
        })
        .unwrap_or_default();

    if base.is_empty() {
        return "download.ts".to_string();
    }
    match base.rsplit_once('.') {
        Some((stem, "m3u8" | "m3u")) if !stem.is_empty() => format!("{stem}.ts"),
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_file_name_swaps_playlist_extension() {
        assert_eq!(
            derive_file_name("https://example.com/live/index.m3u8"),
            "index.ts"
        );
        assert_eq!(
            derive_file_name("https://example.com/video.mp4"),
            "video.mp4"
        );
    }

    #[test]
    fn test_derive_file_name_falls_back_on_bare_hosts() {
        assert_eq!(derive_file_name("https://example.com"), "download.ts");
        assert_eq!(derive_file_name("not a url"), "download.ts");
    }

    #[test]
    fn test_derive_file_name_ignores_query() {
        assert_eq!(
            derive_file_name("https://example.com/a/b/playlist.m3u8?token=x"),
            "playlist.ts"
        );
    }
}

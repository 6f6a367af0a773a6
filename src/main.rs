//! CLI entry point for bulkget.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bulkget_core::download::JobRequest;
use bulkget_core::{BatchScheduler, EngineConfig, JobResult, WebhookNotifier};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;
mod progress_ui;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = EngineConfig::from_env().context("invalid environment configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let urls = read_urls(&args)?;
    if urls.is_empty() {
        info!("No URLs given. Pass them as arguments or pipe them via stdin.");
        return Ok(ExitCode::SUCCESS);
    }
    info!(
        urls = urls.len(),
        output = %config.output_folder.display(),
        concurrency = config.max_concurrent,
        "bulkget starting"
    );

    let mut scheduler = BatchScheduler::from_config(&config)?;
    if let Some(webhook) = &config.webhook_url {
        let notifier = WebhookNotifier::new(webhook.clone()).context("webhook client")?;
        scheduler = scheduler.with_notifier(Arc::new(notifier));
    }

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling; partial files are kept for resume");
            cancel.cancel();
        }
    });

    let total_jobs = urls.len();
    let stop_ui = CancellationToken::new();
    let ui = progress_ui::spawn_progress_ui(
        !args.quiet && io::stderr().is_terminal(),
        scheduler.progress(),
        total_jobs,
        stop_ui.clone(),
    );

    let mut run = scheduler.run(urls.into_iter().map(JobRequest::new).collect::<Vec<_>>());
    while let Some(outcome) = run.outcomes.recv().await {
        match &outcome.result {
            JobResult::Success {
                path,
                bytes,
                already_existed,
            } => info!(
                url = %outcome.url,
                path = %path.display(),
                bytes,
                already_existed,
                "downloaded"
            ),
            JobResult::Failed { class, message } => warn!(
                url = %outcome.url,
                class = %class,
                error = %message,
                "failed"
            ),
        }
    }
    let summary = run.handle.await.context("scheduler task failed")?;

    stop_ui.cancel();
    if let Some(ui) = ui {
        let _ = ui.await;
    }

    println!(
        "{} succeeded, {} failed, {} total ({:.2} MiB/s)",
        summary.succeeded,
        summary.failed,
        summary.total,
        summary.average_speed_mibps()
    );

    if summary.failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// URLs from the arguments, else one per non-blank stdin line.
fn read_urls(args: &Args) -> Result<Vec<String>> {
    if !args.urls.is_empty() {
        return Ok(args.urls.clone());
    }
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("reading URLs from stdin")?;
    Ok(buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

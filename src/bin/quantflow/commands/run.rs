use crate::cli::RunArgs;
use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use quantflow::config::Settings;
use quantflow::utils::format_duration;
use quantflow::{JobService, JobStatus, QuantizationConfig};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

pub async fn handle_run(settings: &Settings, args: RunArgs) -> Result<ExitCode> {
    let mut job = load_job(&args.job)?;
    if let Some(out_dir) = args.out_dir {
        job.out_dir = Some(out_dir);
    }
    let job = job.normalize(&settings.storage.out_dir);
    job.validate().context("Invalid job configuration")?;

    let service = JobService::new(Arc::new(settings.job.executor()), settings.job.options())?;
    if !service.start(&job) {
        bail!("A job is already running");
    }
    println!(
        "Quantizing {} with {} -> {}",
        job.model_id.bold(),
        job.quant_method.to_uppercase(),
        job.out_dir.as_deref().unwrap_or_default()
    );

    let status = follow(&service, Duration::from_millis(args.poll_ms.max(1))).await;
    let snapshot = service.snapshot();
    let elapsed = match (snapshot.started_at, snapshot.finished_at) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    };

    match status {
        JobStatus::Completed => {
            println!(
                "{} in {}: {}",
                "Completed".green().bold(),
                format_duration(elapsed),
                snapshot.result.as_deref().unwrap_or("(no output reported)")
            );
            Ok(ExitCode::SUCCESS)
        }
        JobStatus::Cancelled => {
            eprintln!("{} after {}", "Cancelled".yellow().bold(), format_duration(elapsed));
            Ok(ExitCode::from(130))
        }
        other => {
            eprintln!(
                "{} ({}): {}",
                "Failed".red().bold(),
                other,
                snapshot.error.as_deref().unwrap_or("unknown error")
            );
            Ok(ExitCode::from(1))
        }
    }
}

/// Print new log lines until the job settles. The first Ctrl-C cancels the job.
async fn follow(service: &JobService, poll: Duration) -> JobStatus {
    let mut ticker = tokio::time::interval(poll);
    let mut seq = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    let status = loop {
        tokio::select! {
            status = service.wait() => break status,
            _ = ticker.tick() => print_new_lines(service, &mut seq),
            res = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                if let Err(e) = res {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                    continue;
                }
                eprintln!("{}", "Cancelling job...".yellow());
                let service = service.clone();
                tokio::spawn(async move { service.cancel().await });
            }
        }
    };
    print_new_lines(service, &mut seq);
    status
}

fn print_new_lines(service: &JobService, seq: &mut u64) {
    let (lines, next) = service.logs_since(*seq);
    for line in lines {
        println!("{line}");
    }
    *seq = next;
}

fn load_job(path: &Path) -> Result<QuantizationConfig> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse job file {}", path.display()));
    }

    config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize())
        .with_context(|| format!("Failed to parse job file {}", path.display()))
}

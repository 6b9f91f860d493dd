use crate::cli::GpusArgs;
use anyhow::Result;
use owo_colors::OwoColorize;
use quantflow::config::Settings;
use quantflow::core::gpu::format_summary;
use quantflow::utils::{format_memory, parse_gpu_indices};
use quantflow::{GpuMonitor, GpuSample, Metric};
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

pub async fn handle_gpus(settings: &Settings, args: GpusArgs) -> Result<()> {
    let filter = args.gpus.as_deref().map(parse_gpu_indices).transpose()?;
    let monitor = GpuMonitor::new(settings.telemetry.options());
    let interval = args
        .interval
        .map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or_else(|| settings.telemetry.poll_interval());

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let samples: Vec<GpuSample> = monitor
            .query()
            .await
            .into_iter()
            .filter(|s| filter.as_ref().map_or(true, |f| f.contains(&s.index)))
            .collect();

        if args.watch {
            // Clear screen and move the cursor home
            print!("\x1B[2J\x1B[H");
        }
        if args.summary || samples.is_empty() {
            println!("{}", format_summary(&samples));
        } else {
            print_table(&samples, &monitor, args.metric);
        }

        if !args.watch {
            break;
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct GpuRow {
    #[tabled(rename = "GPU")]
    index: u32,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "UTIL")]
    utilization: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "TEMP")]
    temperature: String,
    #[tabled(rename = "POWER")]
    power: String,
    #[tabled(rename = "AVG")]
    average: String,
}

fn print_table(samples: &[GpuSample], monitor: &GpuMonitor, metric: Metric) {
    let rows: Vec<GpuRow> = samples.iter().map(|s| row(s, monitor, metric)).collect();
    let table = Table::new(&rows).with(Style::empty()).to_string();
    println!("{}", table);
}

/// The AVG column averages `metric` over the device's retained history.
fn row(sample: &GpuSample, monitor: &GpuMonitor, metric: Metric) -> GpuRow {
    let (_, history) = monitor.chart_data(sample.index, metric);
    let average = if history.is_empty() {
        0.0
    } else {
        history.iter().sum::<f64>() / history.len() as f64
    };

    GpuRow {
        index: sample.index,
        name: sample.name.clone(),
        utilization: colorize_percent(sample.utilization),
        memory: format!(
            "{} / {} ({})",
            format_memory(sample.memory_used),
            format_memory(sample.memory_total),
            colorize_percent(sample.memory_percent)
        ),
        temperature: format!("{:.0}°C", sample.temperature),
        power: format!("{:.0}W / {:.0}W", sample.power_draw, sample.power_limit),
        average: format!("{:.1} {}", average, metric),
    }
}

fn colorize_percent(value: f64) -> String {
    let text = format!("{:.1}%", value);
    if value >= 90.0 {
        text.red().to_string()
    } else if value >= 50.0 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

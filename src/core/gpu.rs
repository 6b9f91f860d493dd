//! GPU telemetry gathered by polling `nvidia-smi`.

use super::buffer::BoundedBuffer;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

/// Fields requested from `nvidia-smi --query-gpu`, in row order
pub const QUERY_FIELDS: &str =
    "index,name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw,power.limit";

const FIELD_COUNT: usize = 8;

/// Samples kept per device by default
pub const DEFAULT_HISTORY_SIZE: usize = 60;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SampleParseError {
    #[error("expected 8 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("malformed row: {0}")]
    Csv(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
    },
    #[error("{program} did not answer within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Raw values of one device row
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub index: u32,
    pub name: String,
    pub utilization: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub temperature: f64,
    pub power_draw: f64,
    pub power_limit: f64,
}

/// One device's metrics at one instant. Memory is in MiB, power in watts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub utilization: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
    pub temperature: f64,
    pub power_draw: f64,
    pub power_limit: f64,
    pub power_percent: f64,
    pub timestamp: DateTime<Local>,
}

impl GpuSample {
    pub fn at(reading: Reading, timestamp: DateTime<Local>) -> Self {
        let memory_percent = if reading.memory_total > 0 {
            reading.memory_used as f64 / reading.memory_total as f64 * 100.0
        } else {
            0.0
        };
        let power_percent = if reading.power_limit > 0.0 {
            reading.power_draw / reading.power_limit * 100.0
        } else {
            0.0
        };
        Self {
            index: reading.index,
            name: reading.name,
            utilization: reading.utilization,
            memory_used: reading.memory_used,
            memory_total: reading.memory_total,
            memory_percent,
            temperature: reading.temperature,
            power_draw: reading.power_draw,
            power_limit: reading.power_limit,
            power_percent,
            timestamp,
        }
    }

    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Utilization => self.utilization,
            Metric::MemoryPercent => self.memory_percent,
            Metric::Temperature => self.temperature,
            Metric::PowerDraw => self.power_draw,
            Metric::PowerPercent => self.power_percent,
        }
    }
}

impl From<Reading> for GpuSample {
    fn from(reading: Reading) -> Self {
        Self::at(reading, Local::now())
    }
}

/// Chartable per-sample metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    Utilization,
    MemoryPercent,
    Temperature,
    PowerDraw,
    PowerPercent,
}

fn csv_reader(input: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input)
}

fn field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    position: usize,
    name: &'static str,
) -> Result<T, SampleParseError> {
    let raw = record.get(position).unwrap_or_default();
    raw.parse().map_err(|_| SampleParseError::InvalidNumber {
        field: name,
        value: raw.to_string(),
    })
}

/// Parse one `nvidia-smi` CSV record. Fields past the eighth are ignored.
pub fn parse_record(record: &csv::StringRecord) -> Result<GpuSample, SampleParseError> {
    if record.len() < FIELD_COUNT {
        return Err(SampleParseError::FieldCount(record.len()));
    }
    let reading = Reading {
        index: field(record, 0, "index")?,
        name: record.get(1).unwrap_or_default().to_string(),
        utilization: field(record, 2, "utilization")?,
        memory_used: field(record, 3, "memory_used")?,
        memory_total: field(record, 4, "memory_total")?,
        temperature: field(record, 5, "temperature")?,
        power_draw: field(record, 6, "power_draw")?,
        power_limit: field(record, 7, "power_limit")?,
    };
    Ok(reading.into())
}

/// Parse a single row such as `0, NVIDIA A100, 37, 1024, 40960, 41, 63.2, 400.00`.
pub fn parse_sample(line: &str) -> Result<GpuSample, SampleParseError> {
    let mut reader = csv_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => parse_record(&record),
        Some(Err(e)) => Err(SampleParseError::Csv(e.to_string())),
        None => Err(SampleParseError::FieldCount(0)),
    }
}

/// Parse every row of a query, skipping rows that do not parse.
pub fn parse_samples(output: &str) -> Vec<GpuSample> {
    csv_reader(output.as_bytes())
        .records()
        .enumerate()
        .filter_map(|(row, record)| {
            let parsed = record
                .map_err(|e| SampleParseError::Csv(e.to_string()))
                .and_then(|record| parse_record(&record));
            match parsed {
                Ok(sample) => Some(sample),
                Err(e) => {
                    tracing::debug!("Skipping GPU row {}: {}", row, e);
                    None
                }
            }
        })
        .collect()
}

/// Bounded per-device sample history.
#[derive(Debug)]
pub struct DeviceHistory {
    capacity: usize,
    devices: Mutex<HashMap<u32, BoundedBuffer<GpuSample>>>,
}

impl DeviceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, BoundedBuffer<GpuSample>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples in order, creating entries for new devices.
    pub fn record(&self, samples: &[GpuSample]) {
        let mut devices = self.lock();
        for sample in samples {
            devices
                .entry(sample.index)
                .or_insert_with(|| BoundedBuffer::new(self.capacity))
                .push(sample.clone());
        }
    }

    /// Retained samples for `index`, oldest first; empty for unknown devices.
    pub fn history(&self, index: u32) -> Vec<GpuSample> {
        self.lock()
            .get(&index)
            .map(BoundedBuffer::to_vec)
            .unwrap_or_default()
    }

    pub fn devices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.lock().keys().copied().collect();
        indices.sort_unstable();
        indices
    }
}

impl Default for DeviceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub history_size: usize,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            args: vec![
                format!("--query-gpu={QUERY_FIELDS}"),
                "--format=csv,noheader,nounits".to_string(),
            ],
            timeout: Duration::from_secs(5),
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

/// Polls the device-query tool and keeps per-device history.
#[derive(Debug)]
pub struct GpuMonitor {
    options: TelemetryOptions,
    history: DeviceHistory,
}

impl GpuMonitor {
    pub fn new(options: TelemetryOptions) -> Self {
        let history = DeviceHistory::new(options.history_size);
        Self { options, history }
    }

    /// Current snapshot, one sample per device. Empty if the tool is missing,
    /// fails or times out.
    pub async fn query(&self) -> Vec<GpuSample> {
        match self.run_tool().await {
            Ok(output) => {
                let samples = parse_samples(&output);
                self.history.record(&samples);
                samples
            }
            Err(e) => {
                tracing::debug!("GPU telemetry unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn run_tool(&self) -> Result<String, TelemetryError> {
        let program = &self.options.program;
        let mut command = tokio::process::Command::new(program);
        command
            .args(&self.options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.options.timeout, command.output())
            .await
            .map_err(|_| TelemetryError::Timeout {
                program: program.clone(),
                timeout: self.options.timeout,
            })?
            .map_err(|source| TelemetryError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TelemetryError::Exit {
                program: program.clone(),
                status: output.status,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn history(&self, index: u32) -> Vec<GpuSample> {
        self.history.history(index)
    }

    pub fn devices(&self) -> Vec<u32> {
        self.history.devices()
    }

    /// Timestamps and values of `metric` across a device's history.
    pub fn chart_data(&self, index: u32, metric: Metric) -> (Vec<DateTime<Local>>, Vec<f64>) {
        self.history(index)
            .iter()
            .map(|sample| (sample.timestamp, sample.value(metric)))
            .unzip()
    }
}

impl Default for GpuMonitor {
    fn default() -> Self {
        Self::new(TelemetryOptions::default())
    }
}

/// Short text summary of a snapshot, one block per device.
pub fn format_summary(samples: &[GpuSample]) -> String {
    if samples.is_empty() {
        return "No GPUs detected or nvidia-smi unavailable".to_string();
    }

    let mut lines = Vec::with_capacity(samples.len() * 6);
    for gpu in samples {
        lines.push(format!("GPU {}: {}", gpu.index, gpu.name));
        lines.push(format!("- Utilization: {:.1}%", gpu.utilization));
        lines.push(format!(
            "- Memory: {} MB / {} MB ({:.1}%)",
            gpu.memory_used, gpu.memory_total, gpu.memory_percent
        ));
        lines.push(format!("- Temperature: {:.1}°C", gpu.temperature));
        lines.push(format!(
            "- Power: {:.1}W / {:.1}W ({:.1}%)",
            gpu.power_draw, gpu.power_limit, gpu.power_percent
        ));
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TWO_GPUS: &str = "0, NVIDIA A100-SXM4-40GB, 37, 1024, 40960, 41, 63.25, 400.00\n\
                            1, NVIDIA A100-SXM4-40GB, 0, 0, 40960, 30, 52.10, 400.00\n";

    fn sh_monitor(script: &str, history_size: usize) -> GpuMonitor {
        GpuMonitor::new(TelemetryOptions {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(5),
            history_size,
        })
    }

    fn sample(index: u32, utilization: f64) -> GpuSample {
        GpuSample::from(Reading {
            index,
            name: "Test GPU".to_string(),
            utilization,
            memory_used: 512,
            memory_total: 1024,
            temperature: 50.0,
            power_draw: 100.0,
            power_limit: 200.0,
        })
    }

    #[test]
    fn test_parse_sample() {
        let gpu = parse_sample("0, NVIDIA A100-SXM4-40GB, 37, 1024, 40960, 41, 63.25, 400.00").unwrap();
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(gpu.utilization, 37.0);
        assert_eq!(gpu.memory_used, 1024);
        assert_eq!(gpu.memory_total, 40960);
        assert!((gpu.memory_percent - 2.5).abs() < 1e-9);
        assert_eq!(gpu.temperature, 41.0);
        assert_eq!(gpu.power_draw, 63.25);
        assert!((gpu.power_percent - 15.8125).abs() < 1e-9);
    }

    #[test]
    fn test_derived_percentages_guard_zero() {
        let gpu = parse_sample("2, Tesla T4, 10, 100, 0, 35, 20, 0").unwrap();
        assert_eq!(gpu.memory_percent, 0.0);
        assert_eq!(gpu.power_percent, 0.0);
    }

    #[test]
    fn test_parse_sample_rejects_bad_rows() {
        assert_eq!(
            parse_sample("0, A100, 37, 1024"),
            Err(SampleParseError::FieldCount(4))
        );
        assert!(matches!(
            parse_sample("0, A100, 37, 1024, 40960, 41, [N/A], 400"),
            Err(SampleParseError::InvalidNumber {
                field: "power_draw",
                ..
            })
        ));
        assert!(matches!(
            parse_sample("x, A100, 37, 1024, 40960, 41, 60, 400"),
            Err(SampleParseError::InvalidNumber { field: "index", .. })
        ));
        assert!(parse_sample("").is_err());
    }

    #[test]
    fn test_parse_sample_ignores_extra_fields() {
        let gpu = parse_sample("3, H100, 99, 1, 2, 3, 4, 5, extra").unwrap();
        assert_eq!(gpu.index, 3);
    }

    #[test]
    fn test_parse_samples_skips_malformed_rows() {
        let output = format!("{TWO_GPUS}garbage row\n\n");
        let samples = parse_samples(&output);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].index, 0);
        assert_eq!(samples[1].index, 1);
    }

    #[test]
    fn test_history_is_bounded_per_device() {
        let history = DeviceHistory::new(4);
        for i in 0..7 {
            history.record(&[sample(0, i as f64)]);
        }
        history.record(&[sample(1, 99.0)]);

        let retained: Vec<f64> = history.history(0).iter().map(|s| s.utilization).collect();
        assert_eq!(retained, vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(history.history(1).len(), 1);
        assert!(history.history(7).is_empty());
        assert_eq!(history.devices(), vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_history_concurrent_writers_and_readers() {
        let history = std::sync::Arc::new(DeviceHistory::new(5));
        let mut tasks = Vec::new();
        for writer in 0..4 {
            let history = history.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    history.record(&[sample(0, i as f64), sample(writer, i as f64)]);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..4 {
            let history = history.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    for index in 0..4 {
                        assert!(history.history(index).len() <= 5);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(history.devices(), vec![0, 1, 2, 3]);
        for index in 0..4 {
            assert_eq!(history.history(index).len(), 5);
        }
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(Metric::from_str("memory_percent").unwrap(), Metric::MemoryPercent);
        assert_eq!(Metric::PowerDraw.to_string(), "power_draw");
        assert!(Metric::from_str("fan_speed").is_err());
    }

    #[test]
    fn test_format_summary() {
        assert_eq!(
            format_summary(&[]),
            "No GPUs detected or nvidia-smi unavailable"
        );
        let summary = format_summary(&[sample(0, 12.5)]);
        assert!(summary.contains("GPU 0: Test GPU"));
        assert!(summary.contains("- Utilization: 12.5%"));
        assert!(summary.contains("- Memory: 512 MB / 1024 MB (50.0%)"));
        assert!(summary.contains("- Power: 100.0W / 200.0W (50.0%)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_skips_malformed_and_records_history() {
        let script = format!("printf '{}'; echo 'not, enough, fields'", TWO_GPUS.replace('\n', "\\n"));
        let monitor = sh_monitor(&script, 10);

        let samples = monitor.query().await;
        assert_eq!(samples.len(), 2);
        assert_eq!(monitor.history(0).len(), 1);
        assert_eq!(monitor.history(1).len(), 1);

        monitor.query().await;
        assert_eq!(monitor.history(0).len(), 2);
        assert_eq!(monitor.devices(), vec![0, 1]);

        let (timestamps, values) = monitor.chart_data(0, Metric::Utilization);
        assert_eq!(timestamps.len(), 2);
        assert_eq!(values, vec![37.0, 37.0]);
        assert!(timestamps[0] <= timestamps[1]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_degrades_to_empty() {
        let missing = GpuMonitor::new(TelemetryOptions {
            program: "/nonexistent/nvidia-smi".to_string(),
            ..TelemetryOptions::default()
        });
        assert!(missing.query().await.is_empty());

        let failing = sh_monitor(&format!("printf '{}'; exit 9", TWO_GPUS.replace('\n', "\\n")), 10);
        assert!(failing.query().await.is_empty());
        assert!(failing.devices().is_empty());

        let slow = GpuMonitor::new(TelemetryOptions {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout: Duration::from_millis(100),
            history_size: 10,
        });
        assert!(slow.query().await.is_empty());
    }
}

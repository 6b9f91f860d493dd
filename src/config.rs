use crate::core::executor::RunnerExecutor;
use crate::core::get_config_dir;
use crate::core::gpu::{TelemetryOptions, DEFAULT_HISTORY_SIZE};
use crate::core::quantize::{DEFAULT_HF_DATASETS_CACHE, DEFAULT_HF_HOME, DEFAULT_OUT_ROOT};
use crate::core::service::JobOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Settings {
    #[serde(default)]
    pub job: JobSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JobSettings {
    /// Program that performs the quantization; receives `--config <path>`
    #[serde(default = "default_runner_program")]
    pub runner_program: String,
    #[serde(default = "default_runner_args")]
    pub runner_args: Vec<String>,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// Seconds between SIGTERM and SIGKILL on cancel
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_kill_wait_secs")]
    pub kill_wait_secs: u64,
    #[serde(default = "default_pump_join_timeout_secs")]
    pub pump_join_timeout_secs: u64,
}

fn default_runner_program() -> String {
    "python".to_string()
}

fn default_runner_args() -> Vec<String> {
    vec!["-m".to_string(), "msquant.cli.quantize_run".to_string()]
}

fn default_max_log_lines() -> usize {
    JobOptions::default().max_log_lines
}

fn default_grace_period_secs() -> u64 {
    JobOptions::default().grace_period.as_secs()
}

fn default_kill_wait_secs() -> u64 {
    JobOptions::default().kill_wait.as_secs()
}

fn default_pump_join_timeout_secs() -> u64 {
    JobOptions::default().pump_join_timeout.as_secs()
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            runner_program: default_runner_program(),
            runner_args: default_runner_args(),
            max_log_lines: default_max_log_lines(),
            grace_period_secs: default_grace_period_secs(),
            kill_wait_secs: default_kill_wait_secs(),
            pump_join_timeout_secs: default_pump_join_timeout_secs(),
        }
    }
}

impl JobSettings {
    pub fn options(&self) -> JobOptions {
        JobOptions {
            max_log_lines: self.max_log_lines,
            grace_period: Duration::from_secs(self.grace_period_secs),
            kill_wait: Duration::from_secs(self.kill_wait_secs),
            pump_join_timeout: Duration::from_secs(self.pump_join_timeout_secs),
        }
    }

    pub fn executor(&self) -> RunnerExecutor {
        RunnerExecutor::new(self.runner_program.clone(), self.runner_args.clone())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TelemetrySettings {
    #[serde(default = "default_telemetry_program")]
    pub program: String,
    #[serde(default = "default_telemetry_args")]
    pub args: Vec<String>,
    #[serde(default = "default_telemetry_timeout_secs")]
    pub timeout_secs: u64,
    /// Samples kept per device
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_telemetry_program() -> String {
    TelemetryOptions::default().program
}

fn default_telemetry_args() -> Vec<String> {
    TelemetryOptions::default().args
}

fn default_telemetry_timeout_secs() -> u64 {
    TelemetryOptions::default().timeout.as_secs()
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            program: default_telemetry_program(),
            args: default_telemetry_args(),
            timeout_secs: default_telemetry_timeout_secs(),
            history_size: default_history_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TelemetrySettings {
    pub fn options(&self) -> TelemetryOptions {
        TelemetryOptions {
            program: self.program.clone(),
            args: self.args.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            history_size: self.history_size,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageSettings {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_hf_home")]
    pub hf_home: PathBuf,
    #[serde(default = "default_hf_datasets_cache")]
    pub hf_datasets_cache: PathBuf,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUT_ROOT)
}

fn default_hf_home() -> PathBuf {
    PathBuf::from(DEFAULT_HF_HOME)
}

fn default_hf_datasets_cache() -> PathBuf {
    PathBuf::from(DEFAULT_HF_DATASETS_CACHE)
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            hf_home: default_hf_home(),
            hf_datasets_cache: default_hf_datasets_cache(),
        }
    }
}

/// `QUANTFLOW_<SECTION>__<KEY>`, e.g. `QUANTFLOW_JOB__GRACE_PERIOD_SECS=30`.
fn environment() -> config::Environment {
    config::Environment::with_prefix("QUANTFLOW")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("job.runner_args")
        .with_list_parse_key("telemetry.args")
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Settings, config::ConfigError> {
    let mut config_vec = vec![];

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("quantflow.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {:?} not found", config_path);
        }
    }

    build_settings(&config_vec, environment())
}

fn build_settings(
    files: &[PathBuf],
    environment: config::Environment,
) -> Result<Settings, config::ConfigError> {
    let settings = config::Config::builder();
    let settings = files.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(environment)
        .build()?
        .try_deserialize()
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Debug, Parser)]
#[command(
    name = "quantflow",
    author,
    version = quantflow::core::version(),
    about = "Run model quantization jobs and watch GPU telemetry"
)]
#[command(styles = quantflow::utils::STYLES)]
pub struct QuantFlow {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a quantization job and follow its output (Ctrl-C cancels)
    Run(RunArgs),
    /// Show current GPU telemetry
    Gpus(GpusArgs),
    /// List finished outputs and cache usage
    Outputs {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completion {
        /// The shell to generate the completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Job file (JSON or TOML) describing the quantization
    #[arg(value_name = "JOB_FILE")]
    pub job: PathBuf,

    /// Override the output directory
    #[arg(short, long)]
    pub out_dir: Option<String>,

    /// How often to check for new output, in milliseconds
    #[arg(long, default_value_t = 500, value_name = "MS")]
    pub poll_ms: u64,
}

#[derive(Debug, clap::Args)]
pub struct GpusArgs {
    /// Keep polling and redraw
    #[arg(short, long)]
    pub watch: bool,

    /// Poll interval in milliseconds (defaults to the configured interval)
    #[arg(short, long, value_name = "MS")]
    pub interval: Option<u64>,

    /// Only show these GPUs (e.g., "0,2" or "0-2")
    #[arg(long, value_name = "INDICES")]
    pub gpus: Option<String>,

    /// Metric averaged over the retained history in the AVG column
    /// (utilization, memory_percent, temperature, power_draw, power_percent)
    #[arg(long, default_value = "utilization")]
    pub metric: quantflow::Metric,

    /// Print the plain-text summary instead of a table
    #[arg(long)]
    pub summary: bool,
}

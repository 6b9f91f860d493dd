use crate::cli::Commands;
use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;

pub mod completion;
pub mod gpus;
pub mod outputs;
pub mod run;

pub async fn handle_commands(config_path: &Option<PathBuf>, command: Commands) -> Result<ExitCode> {
    let settings = quantflow::config::load_config(config_path.as_ref())?;
    tracing::debug!("{:?}", settings);

    match command {
        Commands::Run(args) => run::handle_run(&settings, args).await,
        Commands::Gpus(args) => gpus::handle_gpus(&settings, args).await.map(|_| ExitCode::SUCCESS),
        Commands::Outputs { json } => {
            outputs::handle_outputs(&settings, json).map(|_| ExitCode::SUCCESS)
        }
        Commands::Completion { shell } => {
            completion::handle_completion(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

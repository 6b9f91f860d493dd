use std::path::Path;
use std::process::Command;

/// Builds the runner command for a job whose configuration was written to
/// `config_path`.
pub trait Executor: Send + Sync {
    fn command(&self, config_path: &Path) -> Command;

    /// Human-readable command line, for logs
    fn describe(&self, config_path: &Path) -> String {
        let command = self.command(config_path);
        std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|part| shell_escape::escape(part.to_string_lossy()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs `<program> <args...> --config <path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerExecutor {
    pub program: String,
    pub args: Vec<String>,
}

impl RunnerExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Executor for RunnerExecutor {
    fn command(&self, config_path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--config").arg(config_path);
        command
    }
}

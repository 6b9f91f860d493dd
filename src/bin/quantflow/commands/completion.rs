use crate::cli::QuantFlow;
use clap::CommandFactory;
use clap_complete::{generate, Shell};

pub fn handle_completion(shell: Shell) {
    let mut cmd = QuantFlow::command();
    generate(shell, &mut cmd, "quantflow", &mut std::io::stdout());
}

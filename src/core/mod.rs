pub mod buffer;
pub mod executor;
pub mod gpu;
pub mod job;
pub mod process;
pub mod protocol;
pub mod quantize;
pub mod service;
pub mod storage;

use std::path::PathBuf;

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "{}\nAuthors: {author}",
        clap::crate_version!()
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("quantflow"))
}

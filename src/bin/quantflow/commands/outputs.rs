use anyhow::Result;
use owo_colors::OwoColorize;
use quantflow::config::Settings;
use quantflow::core::storage::{CacheEntry, OutputEntry};
use quantflow::StorageService;
use tabled::{settings::Style, Table, Tabled};

pub fn handle_outputs(settings: &Settings, json: bool) -> Result<()> {
    let storage = StorageService::new(
        &settings.storage.out_dir,
        &settings.storage.hf_home,
        &settings.storage.hf_datasets_cache,
    )?;
    let outputs = storage.list_outputs()?;
    let cache = storage.cache_info();

    if json {
        let value = serde_json::json!({ "outputs": outputs, "cache": cache });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if outputs.is_empty() {
        println!("No outputs in {}", storage.out_dir().display());
    } else {
        print_outputs(&outputs);
    }

    println!();
    println!("{}", "Cache".bold());
    print_cache("HF_HOME", &cache.hf_home);
    print_cache("HF_DATASETS_CACHE", &cache.hf_datasets_cache);
    Ok(())
}

#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "MODIFIED")]
    modified: String,
    #[tabled(rename = "PATH")]
    path: String,
}

fn print_outputs(outputs: &[OutputEntry]) {
    let rows: Vec<OutputRow> = outputs
        .iter()
        .map(|o| OutputRow {
            name: o.name.clone(),
            size: o.size.clone(),
            modified: o
                .modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            path: o.path.display().to_string(),
        })
        .collect();
    let table = Table::new(&rows).with(Style::empty()).to_string();
    println!("{}", table);
}

fn print_cache(label: &str, entry: &CacheEntry) {
    let size = if entry.exists {
        entry.size.clone()
    } else {
        "missing".dimmed().to_string()
    };
    println!("  {:<18} {} ({})", label, entry.path.display(), size);
}

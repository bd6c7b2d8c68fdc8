//! Subcommand handlers.

use anyhow::{Context, Result};
use ffbin_core::binaries::{self, ArchiveExtractor, CacheStore, DownloadProgress, HttpFetcher};
use ffbin_core::{BinaryManager, EntryState, Settings};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Cli, Command};

pub async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli);

    match cli.command {
        Command::Install { bin_path, create } => {
            let mut settings = settings;
            if create {
                settings.require_existing_target = false;
            }
            let manager = build_manager(settings)?;
            let installed = manager
                .install(&bin_path)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        tracing::warn!("Install failed with a transient error, retrying may help");
                    }
                    e
                })
                .with_context(|| format!("failed to install into {}", bin_path.display()))?;
            for path in installed {
                println!("{}", path.display());
            }
        }
        Command::Uninstall { bin_path } => {
            let manager = build_manager(settings)?;
            let removed = manager.uninstall(&bin_path)?;
            for path in removed {
                println!("{}", path.display());
            }
        }
        Command::Which { bin_path, tool } => {
            let manager = build_manager(settings)?;
            println!("{}", manager.tool_path(&bin_path, &tool)?.display());
        }
        Command::Status { bin_path, json } => {
            let manager = build_manager(settings)?;
            print_status(&manager, &bin_path, json)?;
        }
        Command::Cache { path } => {
            let root = settings.cache_root();
            if path {
                println!("{}", root.display());
            } else {
                print_cache(&CacheStore::new(root))?;
            }
        }
    }

    Ok(())
}

fn load_settings(cli: &Cli) -> Settings {
    let mut settings = match &cli.config {
        Some(path) => {
            let mut settings = Settings::load_from(path);
            settings.apply_overrides(|key| std::env::var(key).ok());
            settings
        }
        None => Settings::load(),
    };

    if let Some(dir) = &cli.cache_dir {
        settings.cache_dir = Some(dir.clone());
    }
    settings
}

fn build_manager(settings: Settings) -> Result<BinaryManager> {
    let descriptor = binaries::resolve()?;
    let fetcher = HttpFetcher::new(&settings)?.with_progress(progress_reporter());

    Ok(BinaryManager::with_parts(
        settings,
        descriptor,
        Arc::new(fetcher),
        Arc::new(ArchiveExtractor),
    ))
}

/// Logs download progress in 10% steps.
fn progress_reporter() -> impl Fn(DownloadProgress) + Send + Sync + 'static {
    let last_step = AtomicU64::new(u64::MAX);

    move |progress: DownloadProgress| {
        let Some(percent) = progress.percent else {
            return;
        };
        let step = (percent / 10.0) as u64;
        if last_step.swap(step, Ordering::Relaxed) != step {
            tracing::info!(
                "Downloaded {:.0}% ({} bytes)",
                percent,
                progress.bytes_downloaded
            );
        }
    }
}

fn print_status(manager: &BinaryManager, bin_path: &Path, json: bool) -> Result<()> {
    let status = manager.status(bin_path)?;

    let (entry, reason) = match &status.entry {
        EntryState::Ready => ("ready", None),
        EntryState::Missing => ("missing", None),
        EntryState::Corrupt(reason) => ("corrupt", Some(reason.as_str())),
    };

    if json {
        let files: Vec<_> = status
            .files
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "path": f.path,
                    "installed": f.installed,
                })
            })
            .collect();
        let value = serde_json::json!({
            "key": status.key,
            "cache_root": manager.cache_root(),
            "entry": entry,
            "reason": reason,
            "files": files,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("cache root: {}", manager.cache_root().display());
    match reason {
        Some(reason) => println!("entry:      {} ({}, {})", status.key, entry, reason),
        None => println!("entry:      {} ({})", status.key, entry),
    }
    for file in &status.files {
        let mark = if file.installed { "installed" } else { "missing" };
        println!("  {:<12} {:<10} {}", file.name, mark, file.path.display());
    }
    Ok(())
}

fn print_cache(store: &CacheStore) -> Result<()> {
    let keys = store.entries()?;
    if keys.is_empty() {
        println!("no cache entries in {}", store.root().display());
        return Ok(());
    }

    for key in keys {
        match store.get(&key) {
            Ok(Some(entry)) => {
                let names: Vec<&str> = entry.files.iter().map(|f| f.name.as_str()).collect();
                println!(
                    "{}  {:>10} bytes  {}",
                    key,
                    entry.size_bytes(),
                    names.join(", ")
                );
            }
            Ok(None) => {}
            Err(e) => println!("{}  unusable: {}", key, e),
        }
    }
    Ok(())
}

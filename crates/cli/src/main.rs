//! # Packrat
//! The `packrat` CLI lists asset packs, resolves assets through the cache and download
//! pipeline, installs bundles, and maintains the disk cache.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use packrat_core::{AssetIdentity, AssetKind, DownloadEvent, ResolveEvent};
use packrat_hoard::config::parse_byte_size;
use packrat_hoard::{AssetHub, DownloadQueue, HoardConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cache directory (overrides PACKRAT_CACHE)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Bundled packs directory (overrides PACKRAT_PACKS)
    #[arg(long, global = true)]
    packs_dir: Option<PathBuf>,
    /// Cache budget, e.g. 256m or 2g
    #[arg(long, global = true)]
    budget: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered asset packs
    Packs,
    /// List the assets and variants of a pack
    Assets {
        /// Pack id (e.g. pokemon)
        pack: String,
    },
    /// Resolve an asset: bundled pack, cache, then HTTP
    Fetch {
        pack: String,
        asset: String,
        #[arg(long, default_value = "default")]
        variant: String,
        /// Fetch the icon instead of the model
        #[arg(long)]
        icon: bool,
        /// Lower is more urgent
        #[arg(long, default_value = "0")]
        priority: i32,
        /// Register a remote manifest before resolving
        #[arg(long)]
        manifest: Option<String>,
    },
    /// Download a bundle to an explicit path, bypassing the cache
    Install { url: String, dest: PathBuf },
    /// Inspect or clean the disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show usage against the budget
    Stats,
    /// Delete every cached file
    Clear,
    /// Delete one cached asset
    Remove {
        pack: String,
        asset: String,
        #[arg(long, default_value = "default")]
        variant: String,
        #[arg(long)]
        icon: bool,
    },
}

fn identity(pack: String, asset: String, variant: String, icon: bool) -> AssetIdentity {
    let kind = if icon { AssetKind::Icon } else { AssetKind::Model };
    AssetIdentity::new(pack, asset, variant, kind)
}

fn bar(len: u64, template: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_style(ProgressStyle::with_template(template)?.progress_chars("=> "));
    Ok(bar)
}

#[async_std::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = HoardConfig::load()?;
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(dir) = cli.packs_dir {
        config.bundled_packs_dir = dir;
    }
    if let Some(raw) = cli.budget {
        config.cache_budget_bytes =
            parse_byte_size(&raw).with_context(|| format!("Invalid budget '{}'", raw))?;
    }
    let hub = AssetHub::open(config, None).await?;
    log::debug!("Using {:?}", hub.config());

    match cli.command {
        Commands::Packs => {
            let packs = hub.registry().packs();
            if packs.is_empty() {
                println!("No packs found in {:?}", hub.config().pack_dirs());
            }
            for pack in packs {
                let source = match (&pack.base_path, &pack.base_url) {
                    (Some(path), Some(url)) => format!("{} + {}", path.display(), url),
                    (Some(path), None) => path.display().to_string(),
                    (None, Some(url)) => url.clone(),
                    (None, None) => "-".to_string(),
                };
                println!(
                    "{} {} ({} assets{}) {}",
                    pack.pack_id.cyan(),
                    pack.display_name,
                    pack.asset_count(),
                    pack.version
                        .as_deref()
                        .map(|v| format!(", v{}", v))
                        .unwrap_or_default(),
                    source.dimmed()
                );
            }
        }
        Commands::Assets { pack } => {
            let Some(assets) = hub.registry().assets(&pack) else {
                bail!("Unknown pack '{}'", pack);
            };
            let pipeline = hub.pipeline();
            for (asset_id, descriptor) in assets {
                println!("{} {}", asset_id.cyan(), descriptor.display_name);
                for (variant_id, variant) in &descriptor.variants {
                    let id =
                        AssetIdentity::model(pack.as_str(), asset_id.as_str(), variant_id.as_str());
                    let status = if pipeline.is_asset_available(&id) {
                        "available".green()
                    } else {
                        "remote".yellow()
                    };
                    println!(
                        "    {} model={} icon={} [{}]",
                        variant_id,
                        variant.model_file.as_deref().unwrap_or("-"),
                        variant.icon_file.as_deref().unwrap_or("-"),
                        status
                    );
                }
            }
        }
        Commands::Fetch {
            pack,
            asset,
            variant,
            icon,
            priority,
            manifest,
        } => {
            if let Some(url) = manifest {
                let pack = hub.register_remote_manifest(&url).await?;
                println!("📦 Registered {} from {}", pack.pack_id.cyan(), url);
            }

            let id = identity(pack, asset, variant, icon);
            println!("🔎 Resolving {}", id.to_string().cyan());
            let pipeline = hub.pipeline();
            let mut events = pipeline.subscribe();
            let request_id = pipeline.resolve_async(&id, priority);

            let progress = bar(1000, "{spinner} {msg} [{bar:40}] {percent}%")?;
            while let Some(event) = events.next().await {
                if event.request_id() != request_id {
                    continue;
                }
                match event {
                    ResolveEvent::Stage { stage, .. } => {
                        progress.set_message(format!("{:?}", stage));
                    }
                    ResolveEvent::Progress { fraction, .. } => match fraction {
                        Some(fraction) => progress.set_position((fraction * 1000.0) as u64),
                        None => progress.tick(),
                    },
                    ResolveEvent::Resolved { path, .. } => {
                        progress.finish_and_clear();
                        println!("✅ {}", path.display().to_string().green());
                        break;
                    }
                    ResolveEvent::Failed { failure, .. } => {
                        progress.finish_and_clear();
                        bail!("Could not resolve {}: {}", id, failure);
                    }
                }
            }
        }
        Commands::Install { url, dest } => {
            println!("📥 Installing {} -> {}", url.cyan(), dest.display());
            let key = DownloadQueue::key_for_path(&dest);
            let mut events = hub.downloads().subscribe();
            let progress = bar(0, "{bar:40} {bytes}/{total_bytes} {bytes_per_sec}")?;
            let watcher = {
                let progress = progress.clone();
                async_std::task::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let DownloadEvent::Progress {
                            key: k,
                            downloaded,
                            total,
                            ..
                        } = event
                        {
                            if k != key {
                                continue;
                            }
                            if let Some(total) = total {
                                progress.set_length(total);
                            }
                            progress.set_position(downloaded);
                        }
                    }
                })
            };

            let outcome = hub.install(&url, dest, 0).await;
            watcher.cancel().await;
            progress.finish_and_clear();
            match outcome {
                Ok(path) => println!("✅ Installed: {}", path.display().to_string().green()),
                Err(failure) => bail!("Install failed: {}", failure),
            }
        }
        Commands::Cache { action } => {
            let cache = hub.cache();
            match action {
                CacheAction::Stats => {
                    println!(
                        "{} entries, {} of {} bytes ({:.1}%)",
                        cache.len(),
                        cache.size_bytes(),
                        cache.budget_bytes(),
                        cache.usage_fraction() * 100.0
                    );
                    for (key, entry) in cache.entries() {
                        println!(
                            "    {} {} bytes {}",
                            key.cyan(),
                            entry.size_bytes,
                            entry.path.display()
                        );
                    }
                }
                CacheAction::Clear => {
                    cache.clear_all()?;
                    println!("🧹 Cache cleared");
                }
                CacheAction::Remove {
                    pack,
                    asset,
                    variant,
                    icon,
                } => {
                    let id = identity(pack, asset, variant, icon);
                    if cache.remove(&id) {
                        println!("🗑️  Removed {}", id);
                    } else {
                        println!("{} was not cached", id);
                    }
                }
            }
        }
    }

    Ok(())
}

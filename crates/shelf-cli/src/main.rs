//! # shelf CLI
//!
//! Command-line interface for a Shelf object cache directory.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelf_cache::Cache;
use shelf_config::logging::init_logging;
use shelf_config::{log_cli_debug, log_cli_warn, Config};

mod commands;

/// Shelf - label-indexed object cache
#[derive(Parser)]
#[command(name = "shelf")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cache store directory (defaults to the configured one)
    #[arg(long, global = true, env = "SHELF_CACHE_DIR", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file's bytes under the given labels
    Add {
        /// Label to attach, may be repeated
        #[arg(short, long = "label", value_name = "KEY=VALUE", value_parser = commands::parse_label)]
        labels: Vec<(String, String)>,

        /// File to store, or - for stdin
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// List live entries
    Ls {
        #[arg(long, requires = "value")]
        key: Option<String>,

        #[arg(long, requires = "key")]
        value: Option<String>,

        /// Print JSON instead of one line per entry
        #[arg(long)]
        json: bool,
    },

    /// Write the body of the first matching entry to stdout
    Cat {
        #[arg(long)]
        key: String,

        #[arg(long)]
        value: String,
    },

    /// Mark matching entries for removal and delete them
    Rm {
        #[arg(long)]
        key: String,

        #[arg(long)]
        value: String,

        /// Delete even if the entry is still held
        #[arg(long)]
        force: bool,
    },

    /// Show object count and disk usage
    Usage,

    /// Print configuration as TOML
    Config {
        /// Print the loaded configuration instead of the defaults
        #[arg(long)]
        effective: bool,
    },
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();

    // A failed reload keeps the defaults the global instance started with.
    let load_error = shelf_config::reload().err();
    let config = shelf_config::config().clone();
    init_logging(config.logging.log_level());
    if let Some(e) = load_error {
        log_cli_warn!(
            "Ignoring unreadable config",
            error = tracing::field::display(&e),
        );
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Commands::Config { effective } = cli.command {
        let text = if effective {
            toml::to_string_pretty(&config)?
        } else {
            Config::default_toml()?
        };
        out.write_all(text.as_bytes())?;
        return Ok(());
    }

    let cache_dir = cli.cache_dir.unwrap_or_else(|| config.cache_dir());
    log_cli_debug!(
        "Opening cache",
        dir = tracing::field::debug(&cache_dir),
        max_entries = config.cache.max_entries,
    );
    let mut cache = Cache::open(&cache_dir, config.cache.max_entries)
        .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?;

    match cli.command {
        Commands::Add { labels, input } => {
            let body = commands::read_input(&input)?;
            commands::add(
                &mut cache,
                labels,
                &body,
                &config.cache.aggressive_release_keys,
                &mut out,
            )
        }
        Commands::Ls { key, value, json } => {
            let filter = key.as_deref().zip(value.as_deref());
            commands::ls(&cache, filter, json, &mut out)
        }
        Commands::Cat { key, value } => commands::cat(&cache, &key, &value, &mut out),
        Commands::Rm { key, value, force } => {
            commands::rm(&mut cache, &key, &value, force, &mut out)
        }
        Commands::Usage => commands::usage(&cache, &mut out),
        Commands::Config { .. } => Ok(()),
    }?;

    out.flush()?;
    Ok(())
}

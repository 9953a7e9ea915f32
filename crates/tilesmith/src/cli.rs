//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tilesmith_service::config::Config;
use tilesmith_service::metrics;
use url::Url;

use crate::ingest;
use crate::logging;
use crate::server;

/// Tilesmith commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    #[command(name = "run")]
    Run,

    /// Send files of newline-delimited JSON documents to a bulk indexing endpoint.
    #[command(name = "ingest")]
    Ingest {
        /// URL of the bulk endpoint, for example `http://localhost:9200/tiles/_bulk`.
        #[arg(long, value_name = "URL")]
        target: Url,

        /// Files with one JSON document per line.
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "tilesmith", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: No threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(ref tag) = config.metrics.hostname_tag {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag.clone(), name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to set up statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Ingest { target, files } => {
            ingest::run(config, target, files).context("failed to ingest documents")?
        }
    }

    Ok(())
}

//! CLI for the GSP dataset worker.

mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use gsp_core::config::Config;

/// Top-level CLI for the GSP dataset worker.
#[derive(Debug, Parser)]
#[command(name = "gsp")]
#[command(about = "GSP: distributed image-to-gaussian-splat dataset worker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the harvesting pipeline (discover, predict, commit).
    Run {
        /// Cap the number of images produced by this run (overrides MAX_IMAGES).
        #[arg(long, value_name = "N")]
        max_images: Option<u64>,
        /// Listing source: "list" or "search" (overrides SOURCE).
        #[arg(long, value_name = "SOURCE")]
        source: Option<String>,
    },

    /// Serve one pass of the shared request inbox.
    Requests,

    /// Print the globally completed offset prefix.
    DonePrefix,

    /// Sanitize the local catalogue: drop invalid lines, re-normalize rows,
    /// remove duplicates.
    IndexSanitize,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            CliCommand::Run { max_images, source } => {
                let mut cfg = Config::from_env();
                if let Some(n) = max_images {
                    cfg.max_images = Some(n);
                }
                if let Some(s) = source {
                    cfg.source = match s.trim().to_ascii_lowercase().as_str() {
                        "search" => gsp_core::config::SourceKind::Search,
                        _ => gsp_core::config::SourceKind::List,
                    };
                }
                commands::run::run_pipeline(cfg).await
            }
            CliCommand::Requests => {
                let cfg = Config::from_env();
                commands::requests::run_requests(cfg).await
            }
            CliCommand::DonePrefix => {
                let cfg = Config::from_env();
                commands::done_prefix::print_done_prefix(cfg).await
            }
            CliCommand::IndexSanitize => {
                let cfg = Config::from_env();
                commands::index_sanitize::sanitize(cfg).await
            }
            CliCommand::Completions { shell } => {
                let mut cmd = Cli::command();
                let name = cmd.get_name().to_string();
                clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

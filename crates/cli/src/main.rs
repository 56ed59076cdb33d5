mod config;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use custody_workflow::{StageKind, StageTable};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Shipment custody checkpoint workflow.
#[derive(Parser)]
#[command(name = "custody", version, about = "Shipment custody checkpoint workflow")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP JSON API
    Serve {
        /// Path to the custody.toml configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides config and CUSTODY_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the stage table
    Stages {
        /// Path to the custody.toml configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a configuration file without starting the server
    Validate {
        /// Path to the custody.toml configuration
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { config, port } => {
            let config = load_config(config.as_deref(), cli.output, cli.quiet);
            let port = port.unwrap_or(config.server.port);
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    let msg = format!("failed to create tokio runtime: {}", e);
                    report_error(&msg, cli.output, cli.quiet);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config, port)) {
                report_error(&format!("server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Stages { config } => {
            let config = load_config(config.as_deref(), cli.output, cli.quiet);
            cmd_stages(&config, cli.output, cli.quiet);
        }
        Commands::Validate { config } => {
            cmd_validate(&config, cli.output, cli.quiet);
        }
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, output: OutputFormat, quiet: bool) -> Config {
    match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    }
}

fn load_table(config: &Config, output: OutputFormat, quiet: bool) -> StageTable {
    match config.stage_table() {
        Ok(t) => t,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    }
}

fn cmd_stages(config: &Config, output: OutputFormat, quiet: bool) {
    let table = load_table(config, output, quiet);
    match output {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "entry_checkpoint": table.entry_checkpoint(),
                "reentry_checkpoint": table.reentry_checkpoint(),
                "stages": table.stages().collect::<Vec<_>>(),
            });
            let pretty = serde_json::to_string_pretty(&value)
                .unwrap_or_else(|e| format!("serialization error: {}", e));
            println!("{}", pretty);
        }
        OutputFormat::Text => {
            for stage in table.stages() {
                let kind = match stage.kind {
                    StageKind::Pending => "pending",
                    StageKind::Held => "held",
                };
                let next = stage
                    .next
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let mut line = format!(
                    "{:>3}  {:<8} {} -> {}  next {}",
                    stage.checkpoint, kind, stage.from_actor, stage.acting_actor, next
                );
                if stage.captures_assignment {
                    line.push_str("  [assignment]");
                }
                if Some(stage.checkpoint) == table.reentry_checkpoint() {
                    line.push_str("  [re-entry]");
                }
                println!("{}", line);
            }
        }
    }
}

fn cmd_validate(path: &Path, output: OutputFormat, quiet: bool) {
    let config = load_config(Some(path), output, quiet);
    let table = load_table(&config, output, quiet);

    let checks = config
        .check_documents()
        .and_then(|_| config.eligibility_filter().map(|_| ()))
        .and_then(|_| config.master_source());
    let master = match checks {
        Ok(m) => m,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    };

    let stage_count = table.stages().count();
    match output {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "valid": true,
                "stages": stage_count,
                "entry_checkpoint": table.entry_checkpoint(),
                "reentry_checkpoint": table.reentry_checkpoint(),
                "master": master.source_id(),
                "documents": config.documents.is_some(),
            });
            println!("{}", value);
        }
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "{}: valid ({} stages, entry checkpoint {}, master '{}')",
                    path.display(),
                    stage_count,
                    table.entry_checkpoint(),
                    master.source_id()
                );
            }
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

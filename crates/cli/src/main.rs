mod runtime;
mod serve;
mod transfer;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use ferry_core::{DataFlowState, FerryConfig};
use ferry_manager::auth::keys;
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Ferry dataspace data plane.
#[derive(Parser)]
#[command(name = "ferry", version, about = "Ferry dataspace data plane")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// TOML configuration file; FERRY_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the data plane with its signaling API and public endpoint
    Serve {
        /// Port to listen on (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Copy a file or directory through the full data-flow state machine
    Transfer {
        /// Source file, or directory of files
        source: PathBuf,
        /// Destination directory (created on demand)
        destination: PathBuf,
        /// Provision a staging directory for the transfer (needs provisioning.staging_root)
        #[arg(long)]
        staging: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Generate an Ed25519 key pair for signing access tokens
    Keygen {
        /// Output file prefix (writes <prefix>.secret and <prefix>.pub)
        #[arg(long, default_value = "ferry-signing")]
        prefix: String,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            init_tracing();
            let mut config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    report_error(&format!("failed to create tokio runtime: {e}"), cli.output, cli.quiet);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                report_error(&format!("server error: {e}"), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Transfer {
            source,
            destination,
            staging,
        } => {
            init_tracing();
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            cmd_transfer(&config, &source, &destination, staging, cli.output, cli.quiet);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            cmd_config(&config, cli.output, cli.quiet);
        }
        Commands::Keygen { prefix } => {
            cmd_keygen(&prefix, cli.output, cli.quiet);
        }
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(path: Option<&Path>, output: OutputFormat, quiet: bool) -> FerryConfig {
    match FerryConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            report_error(&format!("error: {e}"), output, quiet);
            process::exit(1);
        }
    }
}

fn cmd_transfer(
    config: &FerryConfig,
    source: &Path,
    destination: &Path,
    staging: bool,
    output: OutputFormat,
    quiet: bool,
) {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {e}"), output, quiet);
            process::exit(1);
        }
    };
    let flow = match rt.block_on(transfer::run_transfer(config, source, destination, staging)) {
        Ok(flow) => flow,
        Err(e) => {
            report_error(&format!("error: {e}"), output, quiet);
            process::exit(1);
        }
    };

    let failed = flow.state == DataFlowState::Terminated || flow.error_detail.is_some();
    match output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&flow).unwrap_or_else(|e| format!("serialization error: {e}"))
            );
        }
        OutputFormat::Text => {
            if failed {
                let detail = flow.error_detail.as_deref().unwrap_or("unknown error");
                report_error(&format!("transfer {} failed: {detail}", flow.id), output, quiet);
            } else if !quiet {
                println!("transfer {} {}", flow.id, flow.state);
            }
        }
    }
    if failed {
        process::exit(1);
    }
}

fn cmd_config(config: &FerryConfig, output: OutputFormat, quiet: bool) {
    let rendered = match output {
        OutputFormat::Text => config.to_toml_string().map_err(|e| e.to_string()),
        OutputFormat::Json => serde_json::to_string_pretty(config).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => {
            report_error(&format!("error: {e}"), output, quiet);
            process::exit(1);
        }
    }
}

fn cmd_keygen(prefix: &str, output: OutputFormat, quiet: bool) {
    let (secret, public) = match keys::write_key_pair(prefix) {
        Ok(paths) => paths,
        Err(e) => {
            report_error(&format!("error: {e}"), output, quiet);
            process::exit(1);
        }
    };
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => println!(
            "Generated Ed25519 keypair: {}, {}",
            secret.display(),
            public.display()
        ),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "secret": secret.display().to_string(),
                "public": public.display().to_string(),
            })
        ),
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{{\"error\": \"{}\"}}", msg.replace('"', "\\\""));
        }
    }
}

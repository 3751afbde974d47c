//! ciwi server entrypoint.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod app;
mod config;
mod lifecycle;
mod telemetry;

use ciwi_update::helper::{HelperArgs, run_helper};
use config::{LogFormat, Overrides, ServerConfig};

#[derive(Parser)]
#[command(name = "ciwi")]
#[command(author, version, about = "ciwi CI control plane", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ciwi-server.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve(ServeArgs),

    /// Swap in a downloaded binary and relaunch it
    #[command(hide = true)]
    UpdateHelper(UpdateHelperArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Root for project config files
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

#[derive(Args)]
struct UpdateHelperArgs {
    #[arg(long)]
    target: PathBuf,

    #[arg(long = "new")]
    new_binary: PathBuf,

    #[arg(long)]
    pid: u32,

    /// Argument forwarded to the relaunched binary (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_log_format(raw: &str) -> Result<LogFormat, String> {
    match raw {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("invalid log format: {other}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let overrides = Overrides {
                bind_addr: args.bind,
                data_dir: args.data_dir,
                config_dir: args.config_dir,
                log_format: args.log_format,
            };
            let config = ServerConfig::load(cli.config.as_deref(), overrides)?;
            telemetry::init_tracing(config.log_format);
            app::serve(config).await
        }
        Commands::UpdateHelper(args) => {
            telemetry::init_tracing(LogFormat::Text);
            let helper = HelperArgs {
                target: args.target,
                new_binary: args.new_binary,
                pid: args.pid,
                args: args.args,
            };
            tokio::task::spawn_blocking(move || run_helper(&helper)).await??;
            Ok(())
        }
    }
}

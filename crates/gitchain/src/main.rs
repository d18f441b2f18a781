use clap::{Parser, Subcommand};
use gitchain_ext::{ExtensionManager, ExtensionsConfig};
use miette::{IntoDiagnostic, WrapErr};
use starbase::{App, AppResult, AppSession};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod surface;

use commands::{parse_arg, run_ext_console, run_ext_list, run_ext_run};

/// Environment variable holding the log filter
const LOG_ENV: &str = "GITCHAIN_LOG";

/// gitchain node CLI
#[derive(Parser)]
#[command(name = "gitchain")]
#[command(about = "gitchain node tooling", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to <config dir>/gitchain/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Subcommand)]
enum Commands {
    /// Manage and run extensions
    Ext {
        #[command(subcommand)]
        action: ExtAction,
    },
}

#[derive(Clone, Subcommand)]
enum ExtAction {
    /// List installed extensions
    List,
    /// Run extensions until they finish or Ctrl-C is pressed
    Run {
        /// Extensions to run
        #[arg(required = true)]
        names: Vec<String>,
        /// Argument passed to every extension as `args.<key>`
        #[arg(short, long = "arg", value_name = "KEY=VALUE", value_parser = parse_arg)]
        args: Vec<(String, String)>,
    },
    /// Evaluate code in a console with the `ext` namespace
    Console {
        /// Code to evaluate
        #[arg(short, long, conflicts_with = "file")]
        eval: Option<String>,
        /// Script file to evaluate
        file: Option<PathBuf>,
    },
}

/// Application session for the gitchain CLI
#[derive(Clone)]
struct GitchainSession {
    command: Commands,
    manager: ExtensionManager,
}

#[async_trait::async_trait]
impl AppSession for GitchainSession {
    async fn execute(&mut self) -> AppResult {
        match &self.command {
            Commands::Ext { action } => match action {
                ExtAction::List => run_ext_list(&self.manager),
                ExtAction::Run { names, args } => {
                    run_ext_run(&self.manager, names, args.iter().cloned().collect()).await
                }
                ExtAction::Console { eval, file } => {
                    run_ext_console(&self.manager, eval.clone(), file.clone()).await
                }
            },
        }
    }
}

/// Initialize tracing from `GITCHAIN_LOG`, defaulting to `info`
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gitchain")
        .join("config.toml")
}

fn load_config(path: Option<&Path>) -> miette::Result<ExtensionsConfig> {
    match path {
        Some(path) => ExtensionsConfig::load(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to load configuration from {}", path.display())),
        None => ExtensionsConfig::load_or_default(&default_config_path())
            .into_diagnostic()
            .wrap_err("Failed to load configuration"),
    }
}

#[tokio::main]
async fn main() -> starbase::MainResult {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_deref())?;
    let manager = ExtensionManager::new(&config, surface::node_surface());

    let session = GitchainSession {
        command: cli.command,
        manager,
    };

    let exit_code = App::default()
        .run(
            session,
            |mut session| async move { session.execute().await },
        )
        .await?;

    Ok(std::process::ExitCode::from(exit_code))
}

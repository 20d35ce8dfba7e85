//! juris CLI, the main entry point.
//!
//! Commands:
//! - `serve`   Start the HTTP gateway for the chat UI
//! - `ask`     Ask a question (or chat interactively) from the terminal
//! - `config`  Show, initialize or validate the configuration

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "juris",
    about = "juris: case law research with cited answers",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask a question; without --message, read questions from stdin
    Ask {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration and report problems
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Ask { message, session } => commands::ask::run(message, session).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Init { force } => commands::config_cmd::init(force)?,
            ConfigAction::Validate => commands::config_cmd::validate()?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
    }

    Ok(())
}

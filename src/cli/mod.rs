pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::credentials::CredentialStatus;
use crate::platform::Platform;
use crate::queue::{Priority, QueueStatus};
use crate::session::SessionStatus;
use crate::utils::default_log_file;
use config::OrchestratorConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; the default file in the config directory otherwise
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file; `serve` logs to the data directory
    /// when none is given
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Log file to open, if any
    pub fn log_target(&self) -> Option<PathBuf> {
        match (&self.log_file, &self.command) {
            (Some(path), _) => Some(path.clone()),
            (None, Commands::Serve { .. }) => Some(default_log_file()),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API together with the cooldown and timeout sweeps
    Serve {
        /// Address to bind, overriding api.bind_address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Manage scraper credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialCommand,
    },

    /// Manage the role/location queue
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Inspect and stop scrape sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Show the configuration in use
    Config {
        /// Print the full configuration instead of its path
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(Subcommand)]
pub enum CredentialCommand {
    /// List credentials
    List {
        #[arg(short, long)]
        platform: Option<Platform>,

        #[arg(short, long)]
        status: Option<CredentialStatus>,
    },

    /// Register a credential
    Add {
        #[arg(required = true)]
        platform: Platform,

        /// Label shown on the dashboard
        #[arg(short, long, default_value = "")]
        name: String,

        #[arg(long, requires = "password", conflicts_with = "json")]
        email: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Opaque JSON login payload (cookies, tokens)
        #[arg(long)]
        json: Option<String>,
    },

    /// Put a disabled or failed credential back into rotation
    Enable { id: String },

    /// Take a credential out of rotation
    Disable { id: String },

    /// Clear failure history and make the credential available
    Reset { id: String },

    /// Delete a credential that is not in use
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// List queue entries in dequeue order
    List {
        #[arg(short, long)]
        status: Option<QueueStatus>,

        /// Substring of the role id or location
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },

    /// Request a scrape for a role and location
    Add {
        role: String,
        location: String,

        #[arg(short, long)]
        priority: Option<Priority>,
    },

    /// Approve entries for scraping
    Approve {
        ids: Vec<String>,

        /// Approve every pending entry
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },

    /// Reject a pending entry
    Reject { id: String },

    /// Change an entry's priority
    Priority { id: String, priority: Priority },
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// List recent sessions, newest first
    List {
        #[arg(short, long)]
        status: Option<SessionStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show a session with its platform progress
    Show { id: String },

    /// Terminate a running session and requeue its role
    Terminate { id: String },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    // Every command works from the same validated configuration
    let config = OrchestratorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            info!("Starting orchestrator service");
            commands::serve(config, bind).await
        }
        Commands::Credentials { action } => {
            info!("Running credential command");
            commands::credentials(config, action).await
        }
        Commands::Queue { action } => {
            info!("Running queue command");
            commands::queue(config, action).await
        }
        Commands::Sessions { action } => {
            info!("Running session command");
            commands::sessions(config, action).await
        }
        Commands::Config { show } => commands::show_config(&config, cli.config.as_deref(), show),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parses_typed_arguments() {
        let cli = Cli::try_parse_from([
            "orchestrator",
            "queue",
            "add",
            "role-1",
            "Austin, TX",
            "--priority",
            "urgent",
        ])
        .unwrap();
        match &cli.command {
            Commands::Queue {
                action: QueueCommand::Add { priority, .. },
            } => assert_eq!(*priority, Some(Priority::Urgent)),
            _ => panic!("expected queue add"),
        }

        assert!(cli.log_target().is_none());

        assert!(Cli::try_parse_from(["orchestrator", "credentials", "list", "-p", "indeed"]).is_err());
        assert!(Cli::try_parse_from([
            "orchestrator",
            "credentials",
            "add",
            "linkedin",
            "--email",
            "bot@example.com"
        ])
        .is_err());
    }

    #[test]
    fn test_serve_logs_to_file_by_default() {
        let serve = Cli::try_parse_from(["orchestrator", "serve"]).unwrap();
        assert_eq!(serve.log_target(), Some(default_log_file()));

        let explicit =
            Cli::try_parse_from(["orchestrator", "serve", "--log-file", "/tmp/o.log"]).unwrap();
        assert_eq!(explicit.log_target(), Some(PathBuf::from("/tmp/o.log")));
    }
}

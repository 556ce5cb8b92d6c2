/// CLI argument parsing and command handling

use clap::{Parser, Subcommand};

use crate::utils::DEFAULT_HEALTH_TIMEOUT_SECS;

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "fedops")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show container status for all deployed services
    Status,

    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Restore a service (or the secret store) from a backup generation
    Restore {
        /// What to restore: chat, forum, both, or secrets
        target: String,

        /// Generation token (YYYYMMDD_HHMMSS); prompts if omitted
        generation: Option<String>,

        /// Backup passphrase; prompts if omitted
        passphrase: Option<String>,
    },

    /// Health check report
    Health {
        /// Show healthy checks too, not only problems
        #[arg(short, long)]
        verbose: bool,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Which service to check (chat, forum, all)
        #[arg(short, long, default_value = "all")]
        service: String,

        /// Per-check timeout in seconds
        #[arg(short, long, default_value_t = DEFAULT_HEALTH_TIMEOUT_SECS)]
        timeout: u64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create an encrypted backup of every deployed service
    Create {
        /// Environment variable holding the passphrase
        #[arg(long, default_value = "FEDOPS_PASSPHRASE")]
        passphrase_env: String,
    },

    /// List backup generations on disk
    List,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// View effective configuration
    View,

    /// Validate configuration overrides
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_assertions_hold() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_health_timeout_defaults_from_constant() {
        let cli = Cli::try_parse_from(["fedops", "health"]).unwrap();
        match cli.command {
            Commands::Health { timeout, .. } => {
                assert_eq!(timeout, DEFAULT_HEALTH_TIMEOUT_SECS);
            }
            _ => panic!("expected health subcommand"),
        }
    }
}

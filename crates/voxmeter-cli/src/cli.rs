use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

/// CLI surface definition for the usage-metering toolbox.
#[derive(Parser, Debug)]
#[command(
    name = "voxmeter",
    about = "Voice-agent usage metering: credential vault and metrics sync",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Encrypt a provider API key into a storable blob.
    Encrypt { plaintext: String },
    /// Decrypt a blob back into the original key.
    Decrypt { blob: String },
    /// Check a plaintext key against the provider's API.
    Verify { secret: String },
    /// Manage registered voice agents.
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Sync usage metrics for an agent into the ledger.
    Sync {
        agent_id: Uuid,
        /// Range start (RFC 3339, inclusive).
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// Range end (RFC 3339, inclusive).
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// List recent provider calls for a plaintext key.
    Calls {
        secret: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show recorded usage rows, optionally for one agent.
    Usage { agent_id: Option<Uuid> },
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run a health check against the vault and ledger.
    Health,
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// Encrypt a provider key and register it under a name.
    Add { name: String, secret: String },
    /// List registered agents and their last-synced timestamps.
    List,
    /// Decrypt an agent's stored key and check it against the provider.
    Verify { agent_id: Uuid },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encrypt_subcommand() {
        let cli = Cli::try_parse_from(["voxmeter", "encrypt", "sk_live_x"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Encrypt {
                plaintext: "sk_live_x".into()
            }
        );
    }

    #[test]
    fn parses_sync_with_date_range() {
        let cli = Cli::try_parse_from([
            "voxmeter",
            "sync",
            "8c3f0a54-2a17-4f3c-9a34-31be4a1b8e55",
            "--start",
            "2024-03-01T00:00:00Z",
            "--end",
            "2024-03-31T23:59:59Z",
        ])
        .expect("parse");
        match cli.command {
            Command::Sync { start, end, .. } => {
                assert!(start.is_some());
                assert!(end.is_some());
            }
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_sync_dates() {
        let err = Cli::try_parse_from([
            "voxmeter",
            "sync",
            "8c3f0a54-2a17-4f3c-9a34-31be4a1b8e55",
            "--start",
            "yesterday",
        ])
        .expect_err("must reject");
        assert!(err.to_string().contains("--start"));
    }

    #[test]
    fn calls_defaults_to_ten() {
        let cli = Cli::try_parse_from(["voxmeter", "calls", "sk"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Calls {
                secret: "sk".into(),
                limit: 10
            }
        );
    }

    #[test]
    fn parses_agent_add() {
        let cli =
            Cli::try_parse_from(["voxmeter", "agent", "add", "support", "sk_live_x"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Agent(AgentCommand::Add {
                name: "support".into(),
                secret: "sk_live_x".into()
            })
        );
    }

    #[test]
    fn parses_config_init() {
        let cli = Cli::try_parse_from(["voxmeter", "config", "init"]).expect("parse");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }
}

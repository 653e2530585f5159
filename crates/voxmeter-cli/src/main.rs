mod cli;
mod config;
mod storage;

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voxmeter_core::ledger::LedgerStore;
use voxmeter_ledger::{FileLedger, SyncEngine};
use voxmeter_sync::MetricsClient;
use voxmeter_vault::Vault;

use crate::cli::{AgentCommand, Command, ConfigCommand};

/// Entry point wiring the CLI to the vault, sync client, and ledger.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Encrypt { plaintext } => {
            let vault = Vault::from_env()?;
            println!("{}", vault.encrypt(&plaintext)?);
        }
        Command::Decrypt { blob } => {
            let vault = Vault::from_env()?;
            println!("{}", vault.decrypt(&blob)?);
        }
        Command::Verify { secret } => run_verify(&secret, &config).await?,
        Command::Agent(cmd) => run_agent(cmd, &config).await?,
        Command::Sync {
            agent_id,
            start,
            end,
        } => run_sync(agent_id, start, end, &config).await?,
        Command::Calls { secret, limit } => run_calls(&secret, limit, &config).await?,
        Command::Usage { agent_id } => run_usage(agent_id, &config).await?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Health => run_health_check(&config).await?,
        Command::Version => print_version(),
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("voxmeter {}", env!("CARGO_PKG_VERSION"));
}

fn client_from_config(config: &config::Config) -> Result<MetricsClient> {
    let client = MetricsClient::new()?;
    Ok(match config.provider.as_ref().and_then(|p| p.base_url.clone()) {
        Some(base) => client.with_base_url(base),
        None => client,
    })
}

fn engine_from_config(config: &config::Config) -> Result<SyncEngine<FileLedger, MetricsClient>> {
    let vault = Vault::from_env()?;
    let ledger = storage::ledger_from_config(config)?;
    let client = client_from_config(config)?;
    Ok(SyncEngine::new(vault, ledger, client))
}

async fn run_verify(secret: &str, config: &config::Config) -> Result<()> {
    let client = client_from_config(config)?;
    if client.verify_credential(secret).await {
        println!("Credential accepted by provider.");
    } else {
        println!("Credential rejected (or provider unreachable).");
    }
    Ok(())
}

async fn run_agent(cmd: AgentCommand, config: &config::Config) -> Result<()> {
    match cmd {
        AgentCommand::Add { name, secret } => {
            let engine = engine_from_config(config)?;
            let agent = engine
                .add_agent(&name, &secret)
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            println!("Registered agent '{}' with id {}", agent.name, agent.id);
        }
        AgentCommand::List => {
            let ledger = storage::ledger_from_config(config)?;
            let agents = ledger.list_agents().await?;
            if agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            for agent in agents {
                let synced = agent
                    .last_synced_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let state = if agent.is_active { "active" } else { "inactive" };
                println!("{}  {}  [{}]  last synced: {}", agent.id, agent.name, state, synced);
            }
        }
        AgentCommand::Verify { agent_id } => {
            let engine = engine_from_config(config)?;
            let accepted = engine
                .verify_agent(agent_id)
                .await
                .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
            if accepted {
                println!("Stored credential accepted by provider.");
            } else {
                println!("Stored credential rejected (or provider unreachable).");
            }
        }
    }
    Ok(())
}

async fn run_sync(
    agent_id: uuid::Uuid,
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
    config: &config::Config,
) -> Result<()> {
    let engine = engine_from_config(config)?;
    let outcome = engine
        .sync_agent(agent_id, start, end)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    println!("Synced '{}':", outcome.agent.name);
    println!("  calls:   {}", outcome.snapshot.call_count);
    println!("  minutes: {:.2}", outcome.snapshot.minutes_used);
    println!("  cost:    {:.2}", outcome.snapshot.costs);
    println!("Recorded usage row {}", outcome.record.id);
    Ok(())
}

async fn run_calls(secret: &str, limit: usize, config: &config::Config) -> Result<()> {
    let client = client_from_config(config)?;
    let calls = client.fetch_recent_calls(secret, limit).await?;
    if calls.is_empty() {
        println!("No calls returned.");
        return Ok(());
    }
    for call in calls {
        let started = call
            .started_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "unknown start".to_string());
        let status = call.status.unwrap_or_else(|| "unknown".to_string());
        let cost = call.cost.unwrap_or(0.0);
        println!("{}  {}  {}  ${:.2}", call.id, status, started, cost);
    }
    Ok(())
}

async fn run_usage(agent_id: Option<uuid::Uuid>, config: &config::Config) -> Result<()> {
    let ledger = storage::ledger_from_config(config)?;
    let rows = ledger.list_usage(agent_id).await?;
    if rows.is_empty() {
        println!("No usage recorded.");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}  agent {}  calls: {}  seconds: {}  cost: {:.2}",
            row.recorded_at.to_rfc3339(),
            row.agent_id,
            row.api_calls,
            row.seconds_used,
            row.cost
        );
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

/// Quick check that the vault round-trips and the ledger file is readable.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let vault = Vault::from_env()?;
    let probe = vault.encrypt("health-probe")?;
    if vault.decrypt(&probe)? != "health-probe" {
        color_eyre::eyre::bail!("vault round-trip failed");
    }
    println!("Vault: ok");

    let ledger = storage::ledger_from_config(config)?;
    let agents = ledger.list_agents().await?;
    println!("Ledger: ok ({} agents)", agents.len());
    Ok(())
}

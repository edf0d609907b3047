use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drawsettle_execution::{
    DedupLedger, FileRoundStore, Ledger, RoundEngine, RoundStore, SystemClock,
};
use drawsettle_node::{
    http::{HttpLedger, HttpRandomness, HttpTicketSource},
    Config, ValidatedConfig,
};
use drawsettle_types::{Hash32, RoundConfig, RoundId};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "drawsettle", about = "Operator CLI for the draw settlement engine")]
struct Args {
    /// Node configuration (YAML).
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Register a round in `open`.
    CreateRound {
        #[arg(long)]
        round: RoundId,
        /// Round configuration (YAML).
        #[arg(long)]
        round_config: PathBuf,
        #[arg(long)]
        prize_pool: u64,
        /// Hex-encoded randomness commitment.
        #[arg(long)]
        commitment: String,
    },
    /// Stop ticket sales for a round.
    Close {
        #[arg(long)]
        round: RoundId,
    },
    /// Drive a closed round as far as it will go.
    Advance {
        #[arg(long)]
        round: RoundId,
    },
    Status {
        #[arg(long)]
        round: RoundId,
    },
    /// Resubmit payouts of a partially settled round.
    RetrySettlement {
        #[arg(long)]
        round: RoundId,
    },
    /// Restart a failed round from its last durable stage.
    Resume {
        #[arg(long)]
        round: RoundId,
    },
    Cancel {
        #[arg(long)]
        round: RoundId,
    },
    /// Export the audit document of a round.
    Audit {
        #[arg(long)]
        round: RoundId,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

fn init_tracing(level: Level, json: bool) {
    let builder = tracing_subscriber::fmt().with_max_level(level);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read config file {}", path.display()))?;
    serde_yaml::from_str(&contents).context("Could not parse config file")
}

fn load_round_config(path: &PathBuf) -> Result<RoundConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read round config {}", path.display()))?;
    serde_yaml::from_str(&contents).context("Could not parse round config")
}

fn parse_commitment(value: &str) -> Result<Hash32> {
    let trimmed = value.trim().trim_start_matches("0x");
    Hash32::from_hex(trimmed).context("commitment must be 32 hex-encoded bytes")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    if args.command == Command::CheckConfig {
        println!("{:#?}", config.redacted_debug());
        config.validate()?;
        println!("config ok");
        return Ok(());
    }

    let redacted = format!("{:?}", config.redacted_debug());
    let config = config.validate()?;
    init_tracing(config.log_level, config.log_json);
    info!(config = %redacted, "loaded config file");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(dispatch(config, args.command))
}

async fn dispatch(config: ValidatedConfig, command: Command) -> Result<()> {
    let store = FileRoundStore::open(&config.directory).with_context(|| {
        format!("Could not open round store {}", config.directory.display())
    })?;
    let ledger = HttpLedger::new(
        config.ledger_url.clone(),
        config.call_timeout,
        config.ledger_api_token.clone(),
        config.ledger_rate_per_second,
    )
    .context("Failed to create ledger client")?
    .with_complete_lookup(config.ledger_lookup_authoritative);

    if config.ledger_native_idempotency {
        return run(config, store, ledger, command).await;
    }

    // Seed from the target round's confirmed payouts.
    let mut confirmed = Vec::new();
    if let Some(round_id) = command.round() {
        confirmed = store.get_settlements(round_id)?;
    }
    warn!("ledger lacks idempotency keys, deduplicating transfers locally");
    let ledger = DedupLedger::with_confirmed(ledger, &confirmed);
    run(config, store, ledger, command).await
}

async fn run<L: Ledger>(
    config: ValidatedConfig,
    store: FileRoundStore,
    ledger: L,
    command: Command,
) -> Result<()> {
    let tickets = HttpTicketSource::new(config.ticket_source_url.clone(), config.call_timeout)
        .context("Failed to create ticket source client")?;
    let randomness = HttpRandomness::new(config.randomness_url.clone(), config.call_timeout)
        .context("Failed to create randomness client")?;
    let engine = RoundEngine::new(
        config.engine,
        store,
        tickets,
        randomness,
        ledger,
        SystemClock,
    );

    let round = match command {
        Command::CreateRound {
            round,
            round_config,
            prize_pool,
            commitment,
        } => {
            let round_config = load_round_config(&round_config)?;
            let commitment = parse_commitment(&commitment)?;
            engine.create_round(round, round_config, prize_pool, commitment)?
        }
        Command::Close { round } => engine.close_round(round)?,
        Command::Advance { round } => engine.advance_round(round).await?,
        Command::Status { round } => engine.get_round(round)?,
        Command::RetrySettlement { round } => engine.retry_settlement(round).await?,
        Command::Resume { round } => engine.resume_round(round).await?,
        Command::Cancel { round } => engine.cancel_round(round)?,
        Command::Audit { round, out } => {
            let document = engine.export_audit(round)?;
            let rendered = serde_json::to_string_pretty(&document)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Could not write {}", path.display()))?;
                    info!(round_id = round, path = %path.display(), "audit exported");
                }
                None => println!("{rendered}"),
            }
            return Ok(());
        }
        Command::CheckConfig => return Ok(()),
    };

    info!(round_id = round.id, status = ?round.status, "done");
    print_json(&round)
}

impl Command {
    fn round(&self) -> Option<RoundId> {
        match self {
            Command::CreateRound { round, .. }
            | Command::Close { round }
            | Command::Advance { round }
            | Command::Status { round }
            | Command::RetrySettlement { round }
            | Command::Resume { round }
            | Command::Cancel { round }
            | Command::Audit { round, .. } => Some(*round),
            Command::CheckConfig => None,
        }
    }
}

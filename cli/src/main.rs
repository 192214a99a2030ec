//! Envoy CLI.
//!
//! ```text
//! envoy usage <game-id>
//! envoy ask <model-id> [--system TEXT] [--agent ID] [--game ID] [--phase ID]
//!           [--json FIELD[,FIELD...]] <prompt...>
//! ```
//!
//! `usage` reads the ledger. `ask` sends one prompt through the coordinator
//! and waits for its usage row before exiting.

use std::env;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use envoy_config::EnvoyConfig;
use envoy_core::{CallOptions, Coordinator};
use envoy_ledger::UsageLedger;

const USAGE: &str = "\
Usage:
  envoy usage <game-id>
  envoy ask <model-id> [--system TEXT] [--agent ID] [--game ID] [--phase ID] [--json FIELDS] <prompt...>";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_envoy_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_envoy_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in envoy_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!("Failed to create log dir {}: {e}", parent.display()));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!("Failed to open log file {}: {e}", candidate.display()));
            }
        }
    }

    (None, warnings)
}

fn envoy_log_file_candidates() -> Vec<PathBuf> {
    // ~/.envoy/logs/envoy.log, then ./.envoy/logs/envoy.log
    let mut candidates = vec![envoy_config::envoy_dir().join("logs").join("envoy.log")];
    let local = PathBuf::from(".envoy").join("logs").join("envoy.log");
    if !candidates.contains(&local) {
        candidates.push(local);
    }
    candidates
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Usage {
        game_id: String,
    },
    Ask {
        model_id: String,
        prompt: String,
        system: Option<String>,
        agent: Option<String>,
        game: Option<String>,
        phase: Option<String>,
        json_fields: Option<Vec<String>>,
    },
    Help,
}

fn parse_args<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "usage" => {
            let game_id = args.next().context("usage: missing <game-id>")?;
            if let Some(extra) = args.next() {
                bail!("usage: unexpected argument '{extra}'");
            }
            Ok(Command::Usage { game_id })
        }
        "ask" => parse_ask(args),
        "-h" | "--help" | "help" => Ok(Command::Help),
        other => bail!("unknown command '{other}'"),
    }
}

fn parse_ask(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let model_id = args.next().context("ask: missing <model-id>")?;
    let mut system = None;
    let mut agent = None;
    let mut game = None;
    let mut phase = None;
    let mut json_fields = None;
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("ask: {flag} needs a value"));
        match arg.as_str() {
            "--system" => system = Some(value("--system")?),
            "--agent" => agent = Some(value("--agent")?),
            "--game" => game = Some(value("--game")?),
            "--phase" => phase = Some(value("--phase")?),
            "--json" => {
                let fields: Vec<String> = value("--json")?
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(ToString::to_string)
                    .collect();
                json_fields = Some(fields);
            }
            other => words.push(other.to_string()),
        }
    }

    let prompt = words.join(" ");
    if prompt.trim().is_empty() {
        bail!("ask: missing <prompt>");
    }

    Ok(Command::Ask {
        model_id,
        prompt,
        system,
        agent,
        game,
        phase,
        json_fields,
    })
}

/// Usage summary for one game. A ledger file that does not exist yet is
/// reported as empty and left uncreated.
fn usage_report(ledger_path: &Path, game_id: &str) -> String {
    let empty = format!("No usage recorded for game {game_id}");
    if !ledger_path.is_file() {
        return empty;
    }
    let ledger = UsageLedger::new(ledger_path);
    let by_agent = ledger.stats_by_agent(game_id);
    if by_agent.is_empty() {
        return empty;
    }

    let mut report = format!("Usage for game {game_id}\n");
    for (agent, usage) in &by_agent {
        let _ = writeln!(
            report,
            "  {agent:<16} calls={:<5} input={:<9} output={:<9} models={}",
            usage.calls,
            usage.input_tokens,
            usage.output_tokens,
            usage.models.join(",")
        );
    }
    let totals = ledger.total_stats(game_id);
    let _ = write!(
        report,
        "  {:<16} calls={:<5} input={:<9} output={:<9}",
        "TOTAL", totals.calls, totals.input_tokens, totals.output_tokens
    );
    report
}

async fn run(command: Command) -> Result<()> {
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }
    let config = EnvoyConfig::load()?.unwrap_or_default();

    match command {
        Command::Help => {}
        Command::Usage { game_id } => {
            println!("{}", usage_report(&config.ledger_path(), &game_id));
        }
        Command::Ask {
            model_id,
            prompt,
            system,
            agent,
            game,
            phase,
            json_fields,
        } => {
            let coordinator = Coordinator::from_config(&config)?;

            let mut options = CallOptions::default();
            if let Some(system) = system {
                options = options.with_system_prompt(system);
            }
            if let Some(game) = game {
                options = options.with_game(game);
            }
            if let Some(phase) = phase {
                options = options.with_phase(phase);
            }
            let agent = agent.unwrap_or_default();

            let outcome: Result<String> = match json_fields {
                Some(fields) => coordinator
                    .call_json(&prompt, &model_id, &agent, options.with_expected_fields(fields))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|map| {
                        serde_json::to_string_pretty(&map).context("Failed to format response")
                    }),
                None => coordinator
                    .call_text(&prompt, &model_id, &agent, options)
                    .await
                    .map_err(anyhow::Error::from),
            };

            coordinator.drain_pending_writes().await;
            println!("{}", outcome?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let command = match parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::warn!("Command failed: {e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use pacewarden::core::config::load_config;
use pacewarden::{AppState, EnvironmentSnapshot, Signal, Whitelist};

const USAGE: &str = "usage:
  pacewarden validate --snapshot FILE --whitelist FILE [--context ID]
  pacewarden record --signal FILE
  pacewarden state --context ID
  pacewarden history --context ID [--take N]";

/// Value of `--name VALUE` or `--name=VALUE`.
fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    let mut iter = args.iter();
    while let Some(a) = iter.next() {
        if a == name {
            return iter.next().cloned();
        }
        if let Some(rest) = a.strip_prefix(&prefix) {
            return Some(rest.to_string());
        }
    }
    None
}

fn required(args: &[String], name: &str) -> anyhow::Result<String> {
    flag_value(args, name).ok_or_else(|| anyhow!("missing {}\n{}", name, USAGE))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(PathBuf::from(path))
        .with_context(|| format!("read {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        std::process::exit(64);
    };
    let rest = &args[1..];

    let config = load_config()?;
    info!("storage root: {}", config.storage_root.display());
    let state = AppState::new(config);

    match command.as_str() {
        "validate" => {
            let snapshot: EnvironmentSnapshot = read_json(&required(rest, "--snapshot")?)?;
            let whitelist = Whitelist::load(&PathBuf::from(required(rest, "--whitelist")?))?;
            let result = match flag_value(rest, "--context") {
                Some(ctx) => {
                    state
                        .orchestrator
                        .audit_snapshot(&ctx, &snapshot, &whitelist)
                        .await?
                }
                None => pacewarden::validate(&snapshot, &whitelist),
            };
            print_json(&result)?;
            if result.is_hard_failure() {
                warn!(
                    "baseline rejected: {} violations > {} allowed",
                    result.total_violations, whitelist.max_violations
                );
                std::process::exit(2);
            }
        }
        "record" => {
            let signal: Signal = read_json(&required(rest, "--signal")?)?;
            let adjustment = state.orchestrator.record(signal).await?;
            print_json(&adjustment)?;
        }
        "state" => {
            let ctx = required(rest, "--context")?;
            match state.orchestrator.get_state(&ctx).await? {
                Some(s) => print_json(&s)?,
                None => {
                    warn!("no state recorded for context {}", ctx);
                    println!("null");
                }
            }
        }
        "history" => {
            let ctx = required(rest, "--context")?;
            let take = match flag_value(rest, "--take") {
                Some(v) => v
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("--take expects a number, got '{}'", v))?,
                None => state.config.pacing.history_depth,
            };
            let history = state.orchestrator.get_recent_adjustments(&ctx, take).await?;
            print_json(&history)?;
        }
        "-h" | "--help" | "help" => println!("{}", USAGE),
        other => {
            eprintln!("unknown command '{}'\n{}", other, USAGE);
            std::process::exit(64);
        }
    }

    Ok(())
}

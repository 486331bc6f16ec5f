//! kitrelay - replay tool for the kit fan-out engine
//!
//! Loads a kit configuration snapshot, builds a recording kit for every
//! configured id, replays a JSON-lines event file through the engine and
//! prints what each kit was sent.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kitrelay_core::host::StaticHost;
use kitrelay_core::kits::RecordingKit;
use kitrelay_core::reporting::{MemorySink, ReportingMessage};
use kitrelay_core::{
    CommerceEvent, Config, Event, IdentityType, KitConfiguration, KitFactory, KitManager,
};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "kitrelay")]
#[command(about = "Replay events through the kit fan-out engine")]
#[command(version)]
struct Args {
    /// Application config file (defaults to the XDG config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines event file against a kit configuration snapshot
    Replay {
        /// JSON array of kit configuration blocks
        #[arg(short, long)]
        kits: PathBuf,

        /// JSON-lines file of events to replay
        #[arg(short, long)]
        events: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Validate a kit configuration snapshot
    CheckConfig {
        /// JSON array of kit configuration blocks
        #[arg(short, long)]
        kits: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Text,
}

/// One line of a replay file.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ReplayLine {
    Event(Event),
    Screen(Event),
    Commerce(CommerceEvent),
    Breadcrumb {
        message: String,
    },
    UserAttribute {
        key: String,
        value: String,
    },
    UserAttributeList {
        key: String,
        values: Vec<String>,
    },
    Identity {
        identity_type: IdentityType,
        value: String,
    },
    OptOut {
        opted_out: bool,
    },
    /// Apply a new kit configuration snapshot mid-stream
    Configure {
        kits: Vec<serde_json::Value>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard =
        kitrelay_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Replay {
            kits,
            events,
            format,
        } => replay(&config, &kits, &events, format).await,
        Command::CheckConfig { kits } => check_config(&kits),
    }
}

fn read_snapshot(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read kit snapshot {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("kit snapshot {} is not a JSON array", path.display()))
}

fn read_lines(path: &Path) -> Result<Vec<ReplayLine>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read event file {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid event on line {}", index + 1))
        })
        .collect()
}

async fn replay(config: &Config, kits: &Path, events: &Path, format: Format) -> Result<()> {
    let snapshot = read_snapshot(kits)?;
    let lines = read_lines(events)?;

    // Every id that appears in any snapshot gets a recording kit.
    let mut seen = BTreeSet::new();
    let mut blocks = Vec::new();
    let later_blocks = lines.iter().flat_map(|line| match line {
        ReplayLine::Configure { kits } => kits.as_slice(),
        _ => &[][..],
    });
    for block in snapshot.iter().chain(later_blocks) {
        if let Some(id) = KitConfiguration::extract_id(block) {
            if seen.insert(id) {
                blocks.push(block.clone());
            }
        }
    }
    let mut factory = KitFactory::new();
    RecordingKit::register_snapshot(&mut factory, &blocks);

    let host = Arc::new(StaticHost::from_config(&config.host));
    let sink = Arc::new(MemorySink::new());
    let manager = Arc::new(KitManager::new(
        factory,
        host.clone(),
        sink.clone(),
        &config.engine,
    ));
    let (coordinator, task) = kitrelay_core::coordinator::spawn(Arc::clone(&manager));

    let report = coordinator.update_kits_and_wait(snapshot).await?;
    tracing::info!(?report, "Initial kit configuration applied");
    if format == Format::Text {
        println!(
            "Kits: {} created, {} active, {} failed",
            report.created.len(),
            report.activated.len(),
            report.failed.len()
        );
    }

    let mut total = 0;
    for line in lines {
        match line {
            ReplayLine::Event(event) => {
                manager.log_event(&event);
            }
            ReplayLine::Screen(screen) => {
                manager.log_screen(&screen.name, &screen.attributes);
            }
            ReplayLine::Commerce(event) => {
                manager.log_commerce_event(&event);
            }
            ReplayLine::Breadcrumb { message } => {
                manager.leave_breadcrumb(&message);
            }
            ReplayLine::UserAttribute { key, value } => manager.set_user_attribute(&key, &value),
            ReplayLine::UserAttributeList { key, values } => {
                manager.set_user_attribute_list(&key, &values)
            }
            ReplayLine::Identity {
                identity_type,
                value,
            } => manager.set_user_identity(identity_type, &value),
            ReplayLine::OptOut { opted_out } => {
                manager.set_opt_out(opted_out);
                host.set_opted_out(opted_out);
            }
            ReplayLine::Configure { kits } => {
                let report = coordinator.update_kits_and_wait(kits).await?;
                tracing::info!(?report, "Kit configuration replaced");
            }
        }

        for message in sink.take() {
            print_message(&message, format)?;
            total += 1;
        }
    }

    coordinator.shutdown().await?;
    task.await.context("coordinator task failed")?;

    if format == Format::Text {
        println!("Replay complete: {} reporting message(s)", total);
    }
    Ok(())
}

fn print_message(message: &ReportingMessage, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(message)?),
        Format::Text => {
            let name = message.event_name.as_deref().unwrap_or("-");
            print!(
                "kit {:>4}  {:<18} {}",
                message.destination_id,
                message.message_type.as_str(),
                name
            );
            if !message.projection_reports.is_empty() {
                let derived: Vec<String> = message
                    .projection_reports
                    .iter()
                    .map(|r| format!("#{} {}", r.projection_id, r.derived_event_name))
                    .collect();
                print!("  -> {}", derived.join(", "));
            }
            println!();
        }
    }
    Ok(())
}

fn check_config(kits: &Path) -> Result<()> {
    let snapshot = read_snapshot(kits)?;
    let mut invalid = 0;

    for (index, block) in snapshot.iter().enumerate() {
        match KitConfiguration::from_json(block) {
            Ok(configuration) => println!(
                "kit {}: ok ({}, {} projection rule(s))",
                configuration.id,
                if configuration.enabled {
                    "enabled"
                } else {
                    "disabled"
                },
                configuration.projection_rules.len()
            ),
            Err(e) => {
                invalid += 1;
                println!("block {}: {}", index, e);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} kit configuration block(s) invalid", invalid, snapshot.len());
    }
    println!("All {} kit configuration block(s) valid", snapshot.len());
    Ok(())
}

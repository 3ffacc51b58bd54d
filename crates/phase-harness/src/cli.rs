// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command-line surface: argument parsing, logging setup and rendering.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use phase_config_fs::FsConfigStore;
use phase_core::config::{ConfigService, TrackerConfig};
use phase_core::{descriptors, PhaseStateDescriptor};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::scenario::{self, RunReport, Scenario};

/// Environment variable holding a `tracing` filter; overrides `-v`.
pub const LOG_ENV: &str = "PHASE_LOG";

/// Replay phase tracker tick scenarios.
#[derive(Parser, Debug)]
#[command(name = "phase-harness", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Harness subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a scenario and print one summary per tick
    Run {
        /// Path to the scenario JSON file
        scenario: PathBuf,
        /// Tracker config JSON file; defaults to the saved user config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the phase descriptor table
    Kinds {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective tracker config as JSON
    Config {
        /// Tracker config JSON file; defaults to the saved user config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the effective config to the user config directory
        #[arg(long)]
        save: bool,
    },
}

/// Default log directive for a `-v` count.
pub const fn verbosity_to_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global `tracing` subscriber, writing to stderr.
///
/// [`LOG_ENV`] wins over the `-v` count when set. Repeated calls are ignored.
pub fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(verbosity_to_directive(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses arguments, runs the command and writes to stdout.
pub fn entrypoint() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(cli.command, &mut out)
}

/// Runs one command, writing its output to `out`.
///
/// # Errors
/// I/O and config failures, and `run` when any tick panicked or aborted.
pub fn execute(command: Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Run {
            scenario: path,
            config,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let scenario = Scenario::load(&path)?;
            info!(path = %path.display(), ticks = scenario.ticks.len(), "replaying scenario");
            let report = scenario::run(&scenario, config);
            if json {
                serde_json::to_writer_pretty(&mut *out, &report)?;
                writeln!(out)?;
            } else {
                render_report(&report, out)?;
            }
            if let Some(failed) = report.first_failure() {
                let message = failed
                    .failure
                    .as_ref()
                    .map_or("unknown failure", |f| f.message.as_str());
                bail!("tick {} failed: {message}", failed.tick);
            }
            Ok(())
        }
        Commands::Kinds { json } => {
            let table: Vec<&PhaseStateDescriptor> = descriptors().collect();
            if json {
                serde_json::to_writer_pretty(&mut *out, &table)?;
                writeln!(out)?;
            } else {
                writeln!(out, "{}", descriptor_table(&table))?;
            }
            Ok(())
        }
        Commands::Config { config, save } => {
            let effective = load_config(config.as_deref())?;
            if save {
                let store = FsConfigStore::new()?;
                let base = store.base().to_path_buf();
                ConfigService::new(store).save_tracker_config(&effective)?;
                info!(dir = %base.display(), "tracker config saved");
            }
            serde_json::to_writer_pretty(&mut *out, &effective)?;
            writeln!(out)?;
            Ok(())
        }
    }
}

/// Loads the tracker config.
///
/// With a path, the file must exist and end in `.json`. Without one, the
/// saved user config is used, falling back to defaults when none was saved.
pub fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let Some(path) = path else {
        return Ok(ConfigService::new(FsConfigStore::new()?).tracker_config()?);
    };
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        bail!("config file {} must have a .json extension", path.display());
    }
    let key = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("config file name {} is not valid UTF-8", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let service = ConfigService::new(FsConfigStore::at(dir)?);
    service
        .load::<TrackerConfig>(key)
        .with_context(|| format!("failed to load config {}", path.display()))?
        .with_context(|| format!("config file {} not found", path.display()))
}

fn yes(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        ""
    }
}

/// Renders descriptors as a table, one row per kind.
pub fn descriptor_table(descriptors: &[&PhaseStateDescriptor]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "kind",
        "blocks",
        "spawns",
        "drops",
        "tiles",
        "merge",
        "no events",
        "no sched",
        "own completion",
        "defers",
        "worldgen",
        "ticking",
        "default spawn",
    ]);
    for d in descriptors {
        table.add_row(vec![
            d.kind.name().to_owned(),
            yes(d.captures_block_changes).to_owned(),
            yes(d.captures_entity_spawns).to_owned(),
            yes(d.captures_item_drops).to_owned(),
            yes(d.captures_tile_entity_changes).to_owned(),
            yes(d.already_capturing).to_owned(),
            yes(d.ignores_block_events).to_owned(),
            yes(d.ignores_scheduled_updates).to_owned(),
            yes(d.handles_own_completion).to_owned(),
            yes(d.defers_to_parent).to_owned(),
            yes(d.is_world_generation).to_owned(),
            yes(d.is_ticking).to_owned(),
            d.default_spawn_type.name().to_owned(),
        ]);
    }
    table
}

/// Writes the human-readable form of `report`.
pub fn render_report(report: &RunReport, out: &mut impl Write) -> Result<()> {
    for tick in &report.ticks {
        writeln!(
            out,
            "tick {}: {} ops, {} events, {} world ops",
            tick.tick,
            tick.ops.len(),
            tick.events,
            tick.world_ops
        )?;
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["#", "op", "outcome"]);
        for record in &tick.ops {
            table.add_row(vec![
                record.index.to_string(),
                record.op.to_owned(),
                record.outcome.to_string(),
            ]);
        }
        writeln!(out, "{table}")?;
        for (close, unwind) in tick.closes().enumerate() {
            for failure in &unwind.failures {
                writeln!(
                    out,
                    "  close {close}: {} item failed at {}: {}",
                    failure.stage,
                    failure
                        .pos
                        .map_or_else(|| "-".to_owned(), |pos| pos.to_string()),
                    failure.reason
                )?;
            }
        }
        writeln!(out, "{}", tick.dump)?;
        if tick.dangling > 0 {
            writeln!(out, "  {} dangling frames cleared at tick boundary", tick.dangling)?;
        }
        if let Some(failure) = &tick.failure {
            writeln!(out, "FAILED: {}", failure.message)?;
            writeln!(out, "{}", failure.dump)?;
        }
        writeln!(out)?;
    }
    let world = &report.world;
    writeln!(
        out,
        "world: {} block writes, {} entities, {} items, {} storage ops",
        world.writes.len(),
        world.entities.len(),
        world.items.len(),
        world.journal.len()
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use phase_core::PhaseKind;

    #[test]
    fn verbosity_maps_to_directives() {
        assert_eq!(verbosity_to_directive(0), "warn");
        assert_eq!(verbosity_to_directive(1), "info");
        assert_eq!(verbosity_to_directive(2), "debug");
        assert_eq!(verbosity_to_directive(3), "trace");
        assert_eq!(verbosity_to_directive(9), "trace");
    }

    #[test]
    fn init_logging_is_repeatable() {
        init_logging(0);
        init_logging(3);
    }

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::try_parse_from([
            "phase-harness",
            "-vv",
            "run",
            "scenario.json",
            "--config",
            "tracker.json",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run {
            scenario,
            config,
            json,
        } = cli.command
        else {
            unreachable!("parsed run");
        };
        assert_eq!(scenario, PathBuf::from("scenario.json"));
        assert_eq!(config, Some(PathBuf::from("tracker.json")));
        assert!(json);
    }

    #[test]
    fn run_requires_a_scenario() {
        assert!(Cli::try_parse_from(["phase-harness", "run"]).is_err());
    }

    #[test]
    fn kinds_lists_every_phase() {
        let mut out = Vec::new();
        execute(Commands::Kinds { json: true }, &mut out).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed.len(), PhaseKind::ALL.len());
        assert_eq!(parsed[0]["kind"], "terrain_generation");

        let mut text = Vec::new();
        execute(Commands::Kinds { json: false }, &mut text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("neighbor_notification"));
        assert!(text.contains("drop_item"));
    }

    #[test]
    fn config_file_must_be_json() {
        let err = load_config(Some(Path::new("tracker.toml"))).unwrap_err();
        assert!(err.to_string().contains(".json"));
    }
}

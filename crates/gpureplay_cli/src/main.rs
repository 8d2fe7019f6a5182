//! GPUREPLAY CLI
//!
//! Inspect placement data, replay recorded call traces against the simulated
//! driver, and run the redistribution algorithm by hand.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use gpureplay_core::DEFAULT_HEAP_ALIGNMENT;
use gpureplay_placement::{Marker, PLACEMENT_FILE_NAME, PlacementLog, redistribute_in_heap};
use gpureplay_session::{CallTrace, ReplaySession, SessionConfig};
use gpureplay_sim::{SimConfig, SimulatedDevice};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpureplay")]
#[command(about = "GPUREPLAY - GPU capture/replay address and placement tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a placement data file grouped by heap
    Inspect {
        /// Placement data file
        #[arg(short, long, default_value = PLACEMENT_FILE_NAME)]
        file: PathBuf,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay a recorded call trace against the simulated driver
    Replay {
        /// JSON call trace
        #[arg(short, long)]
        trace: PathBuf,
        /// JSON session config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// JSON simulated driver config
        #[arg(long)]
        device: Option<PathBuf>,
        /// Bytes of padding the driver adds to every footprint
        #[arg(long)]
        padding: Option<u64>,
        /// Placement data file, overriding the config
        #[arg(long)]
        placement_file: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Redistribute a heap's markers
    Redistribute {
        /// JSON array of markers
        #[arg(short, long)]
        markers: PathBuf,
        /// Heap size in bytes
        #[arg(long)]
        heap_size: u64,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Inspect { file, json } => inspect(&file, json)?,
        Commands::Replay {
            trace,
            config,
            device,
            padding,
            placement_file,
            json,
        } => {
            let mut session_config = match config {
                Some(path) => SessionConfig::load(&path)
                    .wrap_err_with(|| format!("loading session config {}", path.display()))?,
                None => SessionConfig::default(),
            };
            if let Some(path) = placement_file {
                session_config.placement_file = path;
            }
            let mut sim_config = match device {
                Some(path) => load_json::<SimConfig>(&path)?,
                None => SimConfig::default(),
            };
            if let Some(padding) = padding {
                sim_config.padding = padding;
            }
            replay(&trace, session_config, sim_config, json)?
        }
        Commands::Redistribute {
            markers,
            heap_size,
            json,
        } => redistribute(&markers, heap_size, json)?,
    };
    print!("{output}");
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn to_json(value: &impl Serialize) -> Result<String> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    Ok(json)
}

fn inspect(path: &Path, json: bool) -> Result<String> {
    let heaps = PlacementLog::load(path)?
        .ok_or_else(|| eyre!("no placement data at {}", path.display()))?;
    if json {
        return to_json(&heaps);
    }

    let mut out = String::new();
    for (heap, placements) in &heaps {
        writeln!(
            out,
            "{heap}: {} records, canonical size {}",
            placements.len(),
            placements.canonical_size(DEFAULT_HEAP_ALIGNMENT)
        )?;
        for record in placements.records() {
            writeln!(
                out,
                "  {:<12} capture {:>10} -> {:>10}  size {:>10}  align {:>6}  desc {}",
                record.resource_key.to_string(),
                record.capture_offset,
                record.current_offset,
                record.size,
                record.alignment,
                record.description
            )?;
        }
    }
    Ok(out)
}

fn replay(trace: &Path, config: SessionConfig, device: SimConfig, json: bool) -> Result<String> {
    let trace = CallTrace::load(trace)?;
    let session = ReplaySession::new(Arc::new(SimulatedDevice::with_config(device)), config);
    let report = session.replay(&trace);
    let written = session.finish();
    if json {
        return to_json(&report);
    }

    let mut out = String::new();
    writeln!(
        out,
        "{} events: {} heaps, {} placed, {} committed, {} released, {} failures",
        report.events, report.heaps, report.placed, report.committed, report.released, report.failures
    )?;
    for placement in &report.placements {
        let moved = if placement.offset == placement.capture_offset {
            ""
        } else {
            " (moved)"
        };
        writeln!(
            out,
            "  {} in {}: {} -> {}{moved}",
            placement.resource, placement.heap, placement.capture_offset, placement.offset
        )?;
    }
    for translation in &report.translations {
        match translation.replay_address {
            Some(replay) => writeln!(out, "  {:#x} -> {replay:#x}", translation.capture_address)?,
            None => writeln!(out, "  {:#x} -> untracked", translation.capture_address)?,
        }
    }
    writeln!(out, "{written} placement records written")?;
    Ok(out)
}

fn redistribute(markers: &Path, heap_size: u64, json: bool) -> Result<String> {
    let markers: Vec<Marker> = load_json(markers)?;
    let result = redistribute_in_heap(&markers, heap_size);
    if json {
        return to_json(&result);
    }

    let mut out = String::new();
    for (marker, start) in markers.iter().zip(&result.starts) {
        writeln!(
            out,
            "{:>10} -> {:>10}  size {:>8}{}",
            marker.start,
            start,
            marker.size,
            if marker.fixed { "  fixed" } else { "" }
        )?;
    }
    writeln!(
        out,
        "end {} of {heap_size}{}",
        result.end,
        if result.exceeds(heap_size) { ", heap must grow" } else { "" }
    )?;
    if !result.conflicts.is_empty() {
        writeln!(out, "fixed markers in the way: {:?}", result.conflicts)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpureplay_core::{AllocationInfo, HeapDesc, ObjectKey, ResourceDesc};
    use gpureplay_session::CallEvent;

    fn write_trace(dir: &Path) -> PathBuf {
        let trace = CallTrace::new(vec![
            CallEvent::CreateHeap {
                key: ObjectKey::new(1),
                desc: HeapDesc::new(1024).with_alignment(64),
                capture_base: Some(0x1_0000_0000),
            },
            CallEvent::CreatePlacedResource {
                key: ObjectKey::new(2),
                heap: ObjectKey::new(1),
                offset: 0,
                desc: ResourceDesc::buffer(256),
                captured: AllocationInfo::new(256, 64),
            },
            CallEvent::CreatePlacedResource {
                key: ObjectKey::new(3),
                heap: ObjectKey::new(1),
                offset: 256,
                desc: ResourceDesc::buffer(256),
                captured: AllocationInfo::new(256, 64),
            },
            CallEvent::TranslateAddress {
                capture_address: 0x1_0000_0110,
            },
        ]);
        let path = dir.join("trace.json");
        std::fs::write(&path, trace.to_json().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_replay_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let trace = write_trace(dir.path());
        let placement = dir.path().join(PLACEMENT_FILE_NAME);
        let config = SessionConfig::default().with_placement_file(&placement);
        let device = SimConfig::new().with_buffer_alignment(64).with_padding(64);

        let out = replay(&trace, config, device, false).unwrap();
        assert!(out.contains("key_3 in key_1: 256 -> 320 (moved)"));
        assert!(out.contains("2 placement records written"));

        let listing = inspect(&placement, false).unwrap();
        assert!(listing.starts_with("key_1: 2 records"));
        let json = inspect(&placement, true).unwrap();
        assert!(json.contains("\"current_offset\": 320"));
    }

    #[test]
    fn test_inspect_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(&dir.path().join("none.dat"), false).is_err());
    }

    #[test]
    fn test_redistribute_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        std::fs::write(
            &path,
            r#"[
                {"start": 0, "recorded_size": 256, "size": 320, "alignment": 64},
                {"start": 256, "recorded_size": 256, "size": 256, "alignment": 64}
            ]"#,
        )
        .unwrap();
        let out = redistribute(&path, 512, false).unwrap();
        assert!(out.contains("end 576 of 512, heap must grow"));
        let json = redistribute(&path, 1024, true).unwrap();
        assert!(json.contains("320"));
    }
}

//! CLI for ARTIO simulation filesets.
//!
//! Provides commands for inspecting header parameters, counting particles
//! and extracting particle data from a fileset prefix.

use std::path::{Path, PathBuf};

use artio::scan;
use artio::{Fileset, OpenMode, ParameterValue, StorageEngine};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// artio: Inspect ARTIO simulation filesets.
#[derive(Parser)]
#[command(name = "artio", version, about)]
struct Cli {
    /// Read files into memory instead of mapping them.
    #[arg(long, global = true)]
    no_mmap: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display format version, curve, species, and every header parameter.
    Info {
        /// Fileset prefix (path without the `.art` extension).
        prefix: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the values of one header parameter.
    Param {
        /// Fileset prefix.
        prefix: PathBuf,

        /// Parameter name.
        name: String,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Count particles per species in an SFC range.
    Count {
        /// Fileset prefix.
        prefix: PathBuf,

        /// First root cell (defaults to 0).
        #[arg(long)]
        start: Option<i64>,

        /// Last root cell, inclusive (defaults to the last root cell).
        #[arg(long)]
        end: Option<i64>,
    },

    /// Print particle positions of one species as CSV.
    Positions {
        /// Fileset prefix.
        prefix: PathBuf,

        /// Species index.
        #[arg(long, default_value = "0")]
        species: usize,

        /// First root cell (defaults to 0).
        #[arg(long)]
        start: Option<i64>,

        /// Last root cell, inclusive (defaults to the last root cell).
        #[arg(long)]
        end: Option<i64>,
    },

    /// Print the first particles of the fileset, cell by cell.
    Head {
        /// Fileset prefix.
        prefix: PathBuf,

        /// Number of particles to print.
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },
}

/// Output format for metadata commands.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON object.
    Json,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = artio::FileEngineConfig {
        use_mmap: !cli.no_mmap,
    };

    let result = match cli.command {
        Commands::Info { prefix, format } => cmd_info(&prefix, config, &format),
        Commands::Param {
            prefix,
            name,
            format,
        } => cmd_param(&prefix, config, &name, &format),
        Commands::Count { prefix, start, end } => cmd_count(&prefix, config, start, end),
        Commands::Positions {
            prefix,
            species,
            start,
            end,
        } => cmd_positions(&prefix, config, species, start, end),
        Commands::Head { prefix, count } => cmd_head(&prefix, config, count),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `artio info <prefix>`.
fn cmd_info(prefix: &Path, config: artio::FileEngineConfig, format: &OutputFormat) -> CliResult {
    let mut fileset = Fileset::open_with(prefix, OpenMode::HEADER, config)?;
    if fileset.has_particles()
        && let Err(e) = fileset.open_particles()
    {
        tracing::warn!("particle files unavailable: {e}");
    }
    let (major, minor) = fileset.version();
    let store = fileset.parameters();

    match format {
        OutputFormat::Json => {
            let parameters: serde_json::Map<String, serde_json::Value> = store
                .iter()
                .filter_map(|key| {
                    let value = store.value(&key.name)?;
                    Some((key.name.clone(), serde_json::to_value(value).ok()?))
                })
                .collect();
            let output = serde_json::json!({
                "prefix": fileset.prefix(),
                "version": format!("{major}.{minor}"),
                "sfc_type": fileset.sfc_type().to_string(),
                "num_root_cells": fileset.num_root_cells(),
                "has_grid": fileset.has_grid(),
                "species": fileset.species(),
                "parameters": parameters,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Fileset: {}", fileset.prefix());
            println!("  Version: {major}.{minor}");
            println!("  SFC type: {}", fileset.sfc_type());
            if let Some(cells) = fileset.num_root_cells() {
                println!("  Root cells: {cells}");
            }
            println!("  Grid: {}", if fileset.has_grid() { "yes" } else { "no" });
            println!();

            println!("Species: {}", fileset.species().len());
            for species in fileset.species() {
                let label = species.label.as_deref().unwrap_or("unlabeled");
                let total = species
                    .total_particles
                    .map_or_else(|| "unknown".to_string(), |t| t.to_string());
                println!(
                    "  {}: {label} ({} primary, {} secondary, {total} particles)",
                    species.index, species.num_primary, species.num_secondary
                );
            }
            println!();

            println!("Parameters: {}", store.len());
            for key in store.iter() {
                println!("  {:<32} {:<8} [{}]", key.name, key.kind.name(), key.length);
            }
        }
    }

    fileset.close()?;
    Ok(())
}

/// Implements `artio param <prefix> <name>`.
fn cmd_param(
    prefix: &Path,
    config: artio::FileEngineConfig,
    name: &str,
    format: &OutputFormat,
) -> CliResult {
    let fileset = Fileset::open_with(prefix, OpenMode::HEADER, config)?;
    let store = fileset.parameters();
    let key = store.describe(name)?;
    let value = store
        .value(name)
        .ok_or_else(|| format!("parameter '{name}' has no values"))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Text => {
            println!("{} ({}, {} values)", key.name, key.kind, key.length);
            println!("{}", format_values(value));
        }
    }
    fileset.close()?;
    Ok(())
}

fn format_values(value: &ParameterValue) -> String {
    fn join<T: ToString>(values: &[T]) -> String {
        values.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
    }
    match value {
        ParameterValue::String(v) => v.join("\n"),
        ParameterValue::Char(v) => String::from_utf8_lossy(v).into_owned(),
        ParameterValue::Int32(v) => join(v),
        ParameterValue::Float32(v) => join(v),
        ParameterValue::Float64(v) => join(v),
        ParameterValue::Int64(v) => join(v),
    }
}

/// Resolves optional range bounds against the fileset's root cells.
fn resolve_range(
    fileset: &Fileset,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<(i64, i64), Box<dyn std::error::Error>> {
    let cells = fileset
        .num_root_cells()
        .ok_or("header does not record num_root_cells")?;
    Ok((start.unwrap_or(0), end.unwrap_or(cells - 1)))
}

/// Implements `artio count <prefix>`.
fn cmd_count(
    prefix: &Path,
    config: artio::FileEngineConfig,
    start: Option<i64>,
    end: Option<i64>,
) -> CliResult {
    let mut fileset = Fileset::open_with(prefix, OpenMode::PARTICLES, config)?;
    let (start, end) = resolve_range(&fileset, start, end)?;
    let counts = scan::count_in_range(&mut fileset, start, end)?;

    println!("Root cells {start}..={end}");
    for (species, count) in fileset.species().iter().zip(&counts) {
        let label = species.label.as_deref().unwrap_or("unlabeled");
        println!("  {}: {label:<16} {count}", species.index);
    }
    println!("  total: {}", counts.iter().sum::<u64>());
    fileset.close()?;
    Ok(())
}

/// Implements `artio positions <prefix>`.
fn cmd_positions(
    prefix: &Path,
    config: artio::FileEngineConfig,
    species: usize,
    start: Option<i64>,
    end: Option<i64>,
) -> CliResult {
    let mut fileset = Fileset::open_with(prefix, OpenMode::PARTICLES, config)?;
    let (start, end) = resolve_range(&fileset, start, end)?;
    let positions = scan::get_positions(&mut fileset, species, start, end)?;

    println!("x,y,z");
    for [x, y, z] in positions {
        println!("{x},{y},{z}");
    }
    fileset.close()?;
    Ok(())
}

/// Implements `artio head <prefix>`.
fn cmd_head(prefix: &Path, config: artio::FileEngineConfig, count: usize) -> CliResult {
    let mut fileset = Fileset::open_with(prefix, OpenMode::PARTICLES, config)?;
    let rows = head_rows(&mut fileset, count)?;

    println!("sfc,species,id,subspecies,primary,secondary");
    for row in &rows {
        println!("{row}");
    }
    tracing::debug!(printed = rows.len(), "head finished");
    fileset.close()?;
    Ok(())
}

/// Formats the first `count` particles, in SFC then species order, as CSV rows.
///
/// Caches every root cell once and streams through them until `count` rows
/// are collected.
fn head_rows<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    count: usize,
) -> artio::Result<Vec<String>> {
    let mut rows = Vec::new();
    let Some(cells) = fileset.num_root_cells() else {
        return Ok(rows);
    };
    if count == 0 {
        return Ok(rows);
    }
    let species = fileset.species().to_vec();
    let mut counts = vec![0u32; species.len()];

    let mut cached = fileset.cached(0, cells - 1)?;
    let mut stream = cached.stream()?;
    for sfc in 0..cells {
        if rows.len() == count {
            break;
        }
        stream.read_root_cell_begin(sfc, &mut counts)?;
        for shape in &species {
            if rows.len() == count {
                break;
            }
            let mut primary = vec![0.0; shape.num_primary];
            let mut secondary = vec![0.0; shape.num_secondary];
            stream.read_species_begin(shape.index)?;
            for _ in 0..counts[shape.index] {
                if rows.len() == count {
                    break;
                }
                let info = stream.read_particle(&mut primary, &mut secondary)?;
                rows.push(format!(
                    "{sfc},{},{},{},{primary:?},{secondary:?}",
                    shape.index, info.id, info.subspecies
                ));
            }
            stream.read_species_end()?;
        }
        stream.read_root_cell_end()?;
    }
    drop(stream);
    cached.release()?;
    Ok(rows)
}

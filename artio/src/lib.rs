//! # artio
//!
//! Typed parameter dictionary and SFC-indexed particle reader for ARTIO
//! simulation filesets.
//!
//! A fileset is one cosmological simulation snapshot: a header of named,
//! typed, array-valued parameters plus particle data stored in root cells
//! ordered along a space-filling curve (SFC). Each root cell holds particles
//! of several species; every particle carries an id, a subspecies tag, and
//! fixed numbers of double precision (primary) and single precision
//! (secondary) variables.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Open / close lifecycle with ownership-checked state transitions
//! - Header parameters discovered by name, described, then fetched by type
//! - Explicit SFC range cache; at most one range active at a time
//! - Stepwise cell/species/particle reader with checked call order
//! - Bulk scans with per-particle callbacks, counts, and position extraction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use artio::{Fileset, OpenMode};
//! use artio::scan;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fileset = Fileset::open("data/snapshot_a1.0000", OpenMode::PARTICLES)?;
//!
//! // Discover a header parameter
//! let key = fileset.parameters().describe("auni")?;
//! let auni = fileset.parameters().get_float64(&key)?;
//! println!("scale factor {auni:?}");
//!
//! // Count particles per species in the first 64 root cells
//! let counts = scan::count_in_range(&mut fileset, 0, 63)?;
//! for (species, count) in fileset.species().iter().zip(&counts) {
//!     println!("{:?}: {count}", species.label);
//! }
//!
//! fileset.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Fileset`]: Top-level handle; owns the engine, parameters and particle state
//! - [`ParameterStore`]: Ordered, typed header dictionary
//! - [`ParticleStream`]: Stepwise reader over the cached range
//! - [`scan`]: Bulk visitors, counts and positions
//! - [`StorageEngine`]: Backend trait, implemented for files and memory
//!
//! ## Modules
//!
//! - [`fileset`]: Open modes, lifecycle, particle subsystem
//! - [`parameter`]: Parameter types, keys and the store
//! - [`species`]: Particle layout from header parameters
//! - [`cache`]: SFC ranges and the range cache
//! - [`stream`]: Stepwise particle reader
//! - [`scan`]: Bulk scans
//! - [`engine`]: Storage engines
//! - [`dataset`]: In-memory datasets
//! - [`format`]: On-disk layout
//! - [`writer`]: Writing datasets to disk
//! - [`error`]: Error types

pub mod cache;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod fileset;
pub mod format;
pub mod parameter;
pub mod scan;
pub mod species;
pub mod stream;
pub mod writer;

// Re-export primary API types at crate root for convenience.
pub use cache::{CacheGuard, SfcRange};
pub use engine::StorageEngine;
pub use engine::file::{FileEngine, FileEngineConfig};
pub use engine::memory::MemoryEngine;
pub use error::{ArtioError, ErrorKind, Result};
pub use fileset::{Fileset, OpenMode, SfcType};
pub use parameter::{Key, ParameterStore, ParameterType, ParameterValue};
pub use scan::{ParticleRef, ParticleVisitor, SpeciesFilter};
pub use species::{ParticleLayout, Species};
pub use stream::{ParticleInfo, ParticleStream};

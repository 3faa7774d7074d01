//! Fileset lifecycle: open, particle subsystem, close.
//!
//! A [`Fileset`] owns one opened dataset. It moves through
//! `Closed -> Opened -> Closed`, with an orthogonal particle sub-state
//! (`ParticlesClosed <-> ParticlesOpened`) that only exists while opened.
//!
//! `close` consumes the handle, so a fileset cannot be closed twice. A fileset
//! that is dropped without `close` still releases its engine, logging any
//! failure instead of returning it.
//!
//! ```rust,no_run
//! use artio::{Fileset, OpenMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fileset = Fileset::open("data/snapshot_a1.0000", OpenMode::PARTICLES)?;
//! for species in fileset.species() {
//!     println!("{}: {:?}", species.index, species.label);
//! }
//! fileset.close()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::SfcRange;
use crate::engine::StorageEngine;
use crate::engine::file::{FileEngine, FileEngineConfig};
use crate::error::{FilesetError, ParameterError, ParticleError, Result};
use crate::parameter::ParameterStore;
use crate::species::{NUM_FILES_KEY, NUM_ROOT_CELLS_KEY, ParticleLayout, Species};

/// Highest major format version this reader understands.
pub const SUPPORTED_MAJOR_VERSION: i32 = 1;

/// Minor format version written by this crate.
pub const SUPPORTED_MINOR_VERSION: i32 = 3;

/// Header parameter holding the major format version.
pub const MAJOR_VERSION_KEY: &str = "ARTIO_MAJOR_VERSION";
/// Header parameter holding the minor format version.
pub const MINOR_VERSION_KEY: &str = "ARTIO_MINOR_VERSION";
/// Header parameter holding the space-filling curve type.
pub const SFC_TYPE_KEY: &str = "sfc_type";
/// Header parameter holding the number of grid files.
pub const NUM_GRID_FILES_KEY: &str = "num_grid_files";

/// Which sub-stores to validate (and open) when a fileset is opened.
///
/// Flags combine with `|`:
///
/// ```rust
/// use artio::OpenMode;
///
/// let mode = OpenMode::PARTICLES | OpenMode::GRID;
/// assert!(mode.contains(OpenMode::PARTICLES));
/// assert!(!OpenMode::HEADER.contains(OpenMode::GRID));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Header parameters only.
    pub const HEADER: Self = Self(0);
    /// Also open the particle subsystem.
    pub const PARTICLES: Self = Self(1);
    /// Also require grid data to be present.
    pub const GRID: Self = Self(2);

    /// Returns `true` if every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Space-filling curve used to order root cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SfcType {
    /// Slabs along x.
    SlabX = 0,
    /// Morton (Z-order) curve.
    Morton = 1,
    /// Hilbert curve.
    #[default]
    Hilbert = 2,
    /// Slabs along y.
    SlabY = 3,
    /// Slabs along z.
    SlabZ = 4,
}

impl SfcType {
    /// Parses the header's integer code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::SlabX),
            1 => Some(Self::Morton),
            2 => Some(Self::Hilbert),
            3 => Some(Self::SlabY),
            4 => Some(Self::SlabZ),
            _ => None,
        }
    }

    /// Returns the header's integer code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for SfcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SlabX => "slab-x",
            Self::Morton => "morton",
            Self::Hilbert => "hilbert",
            Self::SlabY => "slab-y",
            Self::SlabZ => "slab-z",
        };
        f.write_str(name)
    }
}

/// State of the particle subsystem while it is open.
#[derive(Debug)]
pub(crate) struct ParticleState {
    /// Species and file layout read at open time.
    pub(crate) layout: ParticleLayout,
    /// The range currently staged in the engine, if any.
    pub(crate) active_range: Option<SfcRange>,
}

/// Handle to an opened dataset.
///
/// The default engine reads filesets from disk; any [`StorageEngine`] can be
/// wrapped with [`Fileset::from_engine`].
///
/// # Thread Safety
///
/// A fileset is single-reader: every operation that touches engine state takes
/// `&mut self`.
pub struct Fileset<E: StorageEngine = FileEngine> {
    /// The storage engine serving this dataset.
    pub(crate) engine: E,
    /// Mode the fileset was opened with.
    mode: OpenMode,
    /// Header parameter snapshot.
    parameters: ParameterStore,
    /// Format version `(major, minor)` from the header.
    version: (i32, i32),
    /// Curve ordering the root cells.
    sfc_type: SfcType,
    /// Particle sub-state; `None` while particles are closed.
    pub(crate) particles: Option<ParticleState>,
    /// Set once the engine has been closed.
    released: bool,
}

impl Fileset<FileEngine> {
    /// Opens an on-disk fileset.
    ///
    /// `prefix` is the path without extension: the header is read from
    /// `<prefix>.art` and particle files from `<prefix>.pNNN`.
    ///
    /// # Errors
    ///
    /// - [`FilesetError::NotFound`] if the header, or a sub-store requested by
    ///   `mode`, is missing
    /// - [`FilesetError::VersionMismatch`] if the fileset is newer than this reader
    /// - format errors if a file is malformed
    pub fn open<P: AsRef<Path>>(prefix: P, mode: OpenMode) -> Result<Self> {
        Self::open_with(prefix, mode, FileEngineConfig::default())
    }

    /// Opens an on-disk fileset with explicit engine configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Fileset::open`].
    pub fn open_with<P: AsRef<Path>>(
        prefix: P,
        mode: OpenMode,
        config: FileEngineConfig,
    ) -> Result<Self> {
        let engine = FileEngine::open(prefix, config)?;
        Self::from_engine(engine, mode)
    }
}

impl<E: StorageEngine> Fileset<E> {
    /// Wraps an engine, reads its header, and validates it for `mode`.
    ///
    /// If validation fails the engine is closed before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`FilesetError::NotFound`] if `mode` requests a missing sub-store
    /// - [`FilesetError::VersionMismatch`] for unsupported format versions
    /// - [`ParameterError::Corrupted`] for inconsistent header parameters
    pub fn from_engine(engine: E, mode: OpenMode) -> Result<Self> {
        let mut fileset = Self {
            engine,
            mode,
            parameters: ParameterStore::default(),
            version: (0, 9),
            sfc_type: SfcType::default(),
            particles: None,
            released: false,
        };

        // Errors below drop `fileset`, which closes the engine.
        fileset.parameters = ParameterStore::load(&fileset.engine)?;
        fileset.version = read_version(&fileset.parameters)?;
        fileset.sfc_type = read_sfc_type(&fileset.parameters)?;

        if mode.contains(OpenMode::GRID) && !fileset.has_grid() {
            return Err(FilesetError::NotFound {
                prefix: fileset.prefix().to_string(),
                reason: "header has no grid data".to_string(),
            }
            .into());
        }

        if mode.contains(OpenMode::PARTICLES) {
            fileset.open_particles()?;
        }

        tracing::debug!(
            prefix = fileset.prefix(),
            parameters = fileset.parameters.len(),
            version = ?fileset.version,
            "opened fileset"
        );
        Ok(fileset)
    }

    /// Closes the fileset, releasing the particle subsystem and the engine.
    ///
    /// # Errors
    ///
    /// Returns [`FilesetError::CloseFailed`] if the engine reports a failure.
    /// The fileset is released either way.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        let particles = self.release_particles();
        let closed = self.engine.close().map_err(|source| FilesetError::CloseFailed {
            prefix: self.engine.name().to_string(),
            source,
        });
        tracing::debug!(prefix = self.engine.name(), "closed fileset");
        particles?;
        closed?;
        Ok(())
    }

    /// Returns the dataset name reported by the engine (the path prefix for
    /// on-disk filesets).
    pub fn prefix(&self) -> &str {
        self.engine.name()
    }

    /// Returns the mode the fileset was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns the header parameters.
    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Returns the format version `(major, minor)`; `(0, 9)` for filesets
    /// that predate version parameters.
    pub fn version(&self) -> (i32, i32) {
        self.version
    }

    /// Returns the curve ordering the root cells.
    pub fn sfc_type(&self) -> SfcType {
        self.sfc_type
    }

    /// Returns the number of root cells, if the header records it.
    pub fn num_root_cells(&self) -> Option<i64> {
        self.parameters.get_scalar_int64(NUM_ROOT_CELLS_KEY).ok()
    }

    /// Returns `true` if the particle subsystem is open or the header
    /// declares particle files.
    pub fn has_particles(&self) -> bool {
        self.particles.is_some() || positive_count(&self.parameters, NUM_FILES_KEY)
    }

    /// Returns `true` if the header declares grid files.
    pub fn has_grid(&self) -> bool {
        positive_count(&self.parameters, NUM_GRID_FILES_KEY)
    }

    /// Opens the particle subsystem.
    ///
    /// # Errors
    ///
    /// - [`FilesetError::InvalidState`] if particles are already open
    /// - [`FilesetError::NotFound`] if the fileset has no particle data
    pub fn open_particles(&mut self) -> Result<()> {
        if self.particles.is_some() {
            return Err(FilesetError::InvalidState {
                operation: "open particles",
                reason: "particles are already open",
            }
            .into());
        }

        let layout = ParticleLayout::from_parameters(self.engine.name(), &self.parameters)?;
        self.engine.open_particles(&layout)?;
        tracing::debug!(
            prefix = self.engine.name(),
            species = layout.num_species(),
            files = layout.num_files(),
            "opened particles"
        );
        self.particles = Some(ParticleState {
            layout,
            active_range: None,
        });
        Ok(())
    }

    /// Closes the particle subsystem, clearing any cached range first.
    ///
    /// # Errors
    ///
    /// Returns [`FilesetError::InvalidState`] if particles are not open.
    pub fn close_particles(&mut self) -> Result<()> {
        if self.particles.is_none() {
            return Err(FilesetError::InvalidState {
                operation: "close particles",
                reason: "particles are not open",
            }
            .into());
        }
        self.release_particles()
    }

    /// Returns `true` while the particle subsystem is open.
    pub fn particles_open(&self) -> bool {
        self.particles.is_some()
    }

    /// Returns the particle layout, if particles are open.
    pub fn particle_layout(&self) -> Option<&ParticleLayout> {
        self.particles.as_ref().map(|p| &p.layout)
    }

    /// Returns the species records, or an empty slice if particles are closed.
    pub fn species(&self) -> &[Species] {
        self.particle_layout().map(|l| l.species.as_slice()).unwrap_or_default()
    }

    /// Returns the particle state, or [`ParticleError::NotOpen`].
    pub(crate) fn particle_state(&self, operation: &'static str) -> Result<&ParticleState> {
        self.particles
            .as_ref()
            .ok_or_else(|| ParticleError::NotOpen { operation }.into())
    }

    /// Clears any cache and closes the engine's particle subsystem.
    fn release_particles(&mut self) -> Result<()> {
        let Some(state) = self.particles.take() else {
            return Ok(());
        };
        let cleared = match state.active_range {
            Some(_) => self.engine.clear_sfc_cache(),
            None => Ok(()),
        };
        let closed = self.engine.close_particles();
        cleared?;
        closed
    }
}

impl<E: StorageEngine> Drop for Fileset<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release_particles() {
            tracing::warn!(prefix = self.engine.name(), "failed to release particles: {e}");
        }
        if let Err(e) = self.engine.close() {
            tracing::warn!(prefix = self.engine.name(), "failed to close fileset: {e}");
        }
    }
}

impl<E: StorageEngine> fmt::Debug for Fileset<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fileset")
            .field("prefix", &self.prefix())
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("sfc_type", &self.sfc_type)
            .field("parameters", &self.parameters.len())
            .field("particles_open", &self.particles.is_some())
            .finish_non_exhaustive()
    }
}

fn read_version(store: &ParameterStore) -> Result<(i32, i32)> {
    if !store.has_key(MAJOR_VERSION_KEY) {
        return Ok((0, 9));
    }
    let major = store.get_scalar_int32(MAJOR_VERSION_KEY)?;
    let minor = if store.has_key(MINOR_VERSION_KEY) {
        store.get_scalar_int32(MINOR_VERSION_KEY)?
    } else {
        0
    };
    if major > SUPPORTED_MAJOR_VERSION {
        return Err(FilesetError::VersionMismatch {
            major,
            minor,
            supported: SUPPORTED_MAJOR_VERSION,
        }
        .into());
    }
    Ok((major, minor))
}

fn read_sfc_type(store: &ParameterStore) -> Result<SfcType> {
    if !store.has_key(SFC_TYPE_KEY) {
        return Ok(SfcType::Hilbert);
    }
    let code = store.get_scalar_int32(SFC_TYPE_KEY)?;
    SfcType::from_code(code).ok_or_else(|| {
        ParameterError::Corrupted {
            name: SFC_TYPE_KEY.to_string(),
            reason: format!("unknown curve type {code}"),
        }
        .into()
    })
}

fn positive_count(store: &ParameterStore, name: &str) -> bool {
    store
        .get_integers(name)
        .is_ok_and(|values| values.first().is_some_and(|&n| n > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, SpeciesSpec};
    use crate::engine::memory::MemoryEngine;
    use crate::error::ErrorKind;
    use crate::parameter::ParameterValue;

    fn dataset() -> Dataset {
        Dataset::new(8, vec![SpeciesSpec::new("N-BODY", 6, 1)]).unwrap()
    }

    #[test]
    fn test_open_mode_flags() {
        let mode = OpenMode::HEADER | OpenMode::PARTICLES;
        assert!(mode.contains(OpenMode::PARTICLES));
        assert!(!mode.contains(OpenMode::GRID));
        assert!(mode.contains(OpenMode::HEADER));

        let mut mode = OpenMode::HEADER;
        mode |= OpenMode::GRID;
        assert_eq!(mode, OpenMode::GRID);
    }

    #[test]
    fn test_header_only_open() {
        let fileset = Fileset::from_engine(MemoryEngine::new(dataset()), OpenMode::HEADER).unwrap();
        assert!(!fileset.particles_open());
        assert!(fileset.has_particles());
        assert!(!fileset.has_grid());
        assert_eq!(fileset.num_root_cells(), Some(8));
        assert_eq!(fileset.version(), (SUPPORTED_MAJOR_VERSION, SUPPORTED_MINOR_VERSION));
        assert_eq!(fileset.sfc_type(), SfcType::Hilbert);
        assert!(fileset.species().is_empty());
        fileset.close().unwrap();
    }

    #[test]
    fn test_particle_substate_transitions() {
        let mut fileset =
            Fileset::from_engine(MemoryEngine::new(dataset()), OpenMode::HEADER).unwrap();

        let err = fileset.close_particles().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        fileset.open_particles().unwrap();
        assert_eq!(fileset.species().len(), 1);

        let err = fileset.open_particles().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        fileset.close_particles().unwrap();
        assert!(!fileset.particles_open());
        fileset.close().unwrap();
    }

    #[test]
    fn test_particles_mode_opens_particles() {
        let fileset =
            Fileset::from_engine(MemoryEngine::new(dataset()), OpenMode::PARTICLES).unwrap();
        assert!(fileset.particles_open());
        assert_eq!(fileset.particle_layout().unwrap().num_root_cells, 8);
    }

    #[test]
    fn test_missing_particles_is_not_found() {
        let header_only = Dataset::new(8, vec![]).unwrap();
        let err = Fileset::from_engine(MemoryEngine::new(header_only), OpenMode::PARTICLES)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_grid_mode_requires_grid_files() {
        let err =
            Fileset::from_engine(MemoryEngine::new(dataset()), OpenMode::GRID).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut with_grid = dataset();
        with_grid.set_parameter(NUM_GRID_FILES_KEY, vec![1i32]);
        let fileset = Fileset::from_engine(MemoryEngine::new(with_grid), OpenMode::GRID).unwrap();
        assert!(fileset.has_grid());
    }

    #[test]
    fn test_newer_major_version_rejected() {
        let mut newer = dataset();
        newer.set_parameter(MAJOR_VERSION_KEY, vec![SUPPORTED_MAJOR_VERSION + 1]);
        let err = Fileset::from_engine(MemoryEngine::new(newer), OpenMode::HEADER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_unknown_sfc_type_is_corrupted() {
        let mut bad = dataset();
        bad.set_parameter(SFC_TYPE_KEY, vec![9i32]);
        let err = Fileset::from_engine(MemoryEngine::new(bad), OpenMode::HEADER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);

        let mut morton = dataset();
        morton.set_parameter(SFC_TYPE_KEY, vec![SfcType::Morton.code()]);
        let fileset = Fileset::from_engine(MemoryEngine::new(morton), OpenMode::HEADER).unwrap();
        assert_eq!(fileset.sfc_type(), SfcType::Morton);
    }

    #[test]
    fn test_close_releases_cache() {
        let mut fileset =
            Fileset::from_engine(MemoryEngine::new(dataset()), OpenMode::PARTICLES).unwrap();
        fileset.cache_range(0, 7).unwrap();
        fileset.close().unwrap();
    }

    #[test]
    fn test_parameters_available_after_open() {
        let mut data = dataset();
        data.set_parameter("auni", ParameterValue::Float64(vec![0.25]));
        let fileset = Fileset::from_engine(MemoryEngine::new(data), OpenMode::HEADER).unwrap();
        assert_eq!(fileset.parameters().get_scalar_float64("auni").unwrap(), 0.25);
    }
}

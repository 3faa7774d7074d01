//! Stateful particle stream reader.
//!
//! [`ParticleStream`] reads a cached range cell by cell:
//!
//! ```text
//! Idle --read_root_cell_begin--> RootCell --read_species_begin--> Species
//!  ^                               |  ^                             |
//!  +------read_root_cell_end-------+  +------read_species_end-------+
//! ```
//!
//! `read_particle` is only valid in `Species` and at most `counts[species]`
//! times per species. Any call made in the wrong state fails with
//! `InvalidState` and leaves the reader where it was.
//!
//! # Example
//!
//! ```rust,no_run
//! use artio::{Fileset, OpenMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fileset = Fileset::open("data/snapshot", OpenMode::PARTICLES)?;
//! fileset.cache_range(0, 7)?;
//!
//! let layout = fileset.particle_layout().cloned().ok_or("no particles")?;
//! let mut counts = vec![0u32; layout.num_species()];
//! let mut stream = fileset.stream()?;
//! for sfc in 0..=7 {
//!     stream.read_root_cell_begin(sfc, &mut counts)?;
//!     for (index, species) in layout.species.iter().enumerate() {
//!         let mut primary = vec![0.0; species.num_primary];
//!         let mut secondary = vec![0.0; species.num_secondary];
//!         stream.read_species_begin(index)?;
//!         for _ in 0..counts[index] {
//!             let info = stream.read_particle(&mut primary, &mut secondary)?;
//!             println!("{sfc} {index} {} {:?}", info.id, &primary[..3]);
//!         }
//!         stream.read_species_end()?;
//!     }
//!     stream.read_root_cell_end()?;
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::StorageEngine;
use crate::error::{ParticleError, Result};
use crate::fileset::{Fileset, ParticleState};

/// Identity of one decoded particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticleInfo {
    /// Particle id.
    pub id: i64,
    /// Subspecies tag.
    pub subspecies: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    RootCell { sfc: i64 },
    Species { sfc: i64, species: usize, remaining: u32 },
}

impl StreamState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "no root cell is open",
            Self::RootCell { .. } => "a root cell is open",
            Self::Species { .. } => "a species is open",
        }
    }
}

/// Cell-by-cell reader over the cached SFC range.
///
/// Created by [`Fileset::stream`]. The stream borrows the fileset mutably, so
/// the cache cannot change while it is alive. Dropping a stream mid-cell
/// closes the open species and cell.
pub struct ParticleStream<'f, E: StorageEngine> {
    fileset: &'f mut Fileset<E>,
    state: StreamState,
    counts: Vec<u32>,
}

impl<E: StorageEngine> Fileset<E> {
    /// Starts a stream reader over the cached range.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleError::NotOpen`] if particles are not open.
    pub fn stream(&mut self) -> Result<ParticleStream<'_, E>> {
        let num_species = self.particle_state("start a particle stream")?.layout.num_species();
        Ok(ParticleStream {
            fileset: self,
            state: StreamState::Idle,
            counts: vec![0; num_species],
        })
    }
}

impl<E: StorageEngine> ParticleStream<'_, E> {
    fn particles(&self, operation: &'static str) -> Result<&ParticleState> {
        self.fileset.particle_state(operation)
    }

    fn wrong_state(&self, operation: &'static str) -> crate::error::ArtioError {
        ParticleError::InvalidState {
            operation,
            state: self.state.name(),
        }
        .into()
    }

    /// Opens root cell `sfc` and writes the particle count of each species to
    /// `counts`.
    ///
    /// # Errors
    ///
    /// - [`ParticleError::InvalidState`] unless the reader is idle
    /// - [`ParticleError::BufferLength`] if `counts.len() != num_species`
    /// - [`ParticleError::SfcNotCached`] if `sfc` is outside the cached range
    pub fn read_root_cell_begin(&mut self, sfc: i64, counts: &mut [u32]) -> Result<()> {
        const OPERATION: &str = "begin a root cell";
        if self.state != StreamState::Idle {
            return Err(self.wrong_state(OPERATION));
        }
        let state = self.particles(OPERATION)?;
        let num_species = state.layout.num_species();
        if counts.len() != num_species {
            return Err(ParticleError::BufferLength {
                buffer: "species count",
                expected: num_species,
                found: counts.len(),
            }
            .into());
        }
        let cached = state.active_range;
        if !cached.is_some_and(|range| range.contains(sfc)) {
            return Err(ParticleError::SfcNotCached { sfc, cached }.into());
        }

        self.fileset.engine.read_root_cell_begin(sfc, counts)?;
        self.counts.copy_from_slice(counts);
        self.state = StreamState::RootCell { sfc };
        tracing::trace!(sfc, ?counts, "began root cell");
        Ok(())
    }

    /// Positions at the first particle of `species` in the open cell.
    ///
    /// # Errors
    ///
    /// - [`ParticleError::InvalidState`] unless a root cell is open and no
    ///   species is
    /// - [`ParticleError::InvalidSpecies`] if `species >= num_species`
    pub fn read_species_begin(&mut self, species: usize) -> Result<()> {
        let StreamState::RootCell { sfc } = self.state else {
            return Err(self.wrong_state("begin a species"));
        };
        let num_species = self.counts.len();
        if species >= num_species {
            return Err(ParticleError::InvalidSpecies {
                species,
                num_species,
            }
            .into());
        }

        self.fileset.engine.read_species_begin(species)?;
        self.state = StreamState::Species {
            sfc,
            species,
            remaining: self.counts[species],
        };
        Ok(())
    }

    /// Reads the next particle of the open species.
    ///
    /// `primary` and `secondary` must be exactly as long as the species'
    /// variable counts.
    ///
    /// # Errors
    ///
    /// - [`ParticleError::InvalidState`] if no species is open or every
    ///   particle of it has been read
    /// - [`ParticleError::BufferLength`] if a buffer has the wrong length
    pub fn read_particle(
        &mut self,
        primary: &mut [f64],
        secondary: &mut [f32],
    ) -> Result<ParticleInfo> {
        const OPERATION: &str = "read a particle";
        let StreamState::Species {
            sfc,
            species,
            remaining,
        } = self.state
        else {
            return Err(self.wrong_state(OPERATION));
        };
        if remaining == 0 {
            return Err(ParticleError::InvalidState {
                operation: OPERATION,
                state: "every particle of the species has been read",
            }
            .into());
        }
        let shape = &self.particles(OPERATION)?.layout.species[species];
        check_buffer("primary", shape.num_primary, primary.len())?;
        check_buffer("secondary", shape.num_secondary, secondary.len())?;

        let info = self.fileset.engine.read_particle(primary, secondary)?;
        self.state = StreamState::Species {
            sfc,
            species,
            remaining: remaining - 1,
        };
        Ok(info)
    }

    /// Closes the open species. Unread particles are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleError::InvalidState`] if no species is open.
    pub fn read_species_end(&mut self) -> Result<()> {
        let StreamState::Species { sfc, .. } = self.state else {
            return Err(self.wrong_state("end a species"));
        };
        self.fileset.engine.read_species_end()?;
        self.state = StreamState::RootCell { sfc };
        Ok(())
    }

    /// Closes the open root cell.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleError::InvalidState`] unless a root cell is open and
    /// no species is.
    pub fn read_root_cell_end(&mut self) -> Result<()> {
        let StreamState::RootCell { sfc } = self.state else {
            return Err(self.wrong_state("end a root cell"));
        };
        self.fileset.engine.read_root_cell_end()?;
        self.state = StreamState::Idle;
        tracing::trace!(sfc, "ended root cell");
        Ok(())
    }

    /// Returns the open root cell.
    pub fn current_sfc(&self) -> Option<i64> {
        match self.state {
            StreamState::Idle => None,
            StreamState::RootCell { sfc } | StreamState::Species { sfc, .. } => Some(sfc),
        }
    }

    /// Returns the open species.
    pub fn current_species(&self) -> Option<usize> {
        match self.state {
            StreamState::Species { species, .. } => Some(species),
            _ => None,
        }
    }

    /// Returns how many particles of the open species are left to read.
    pub fn remaining(&self) -> Option<u32> {
        match self.state {
            StreamState::Species { remaining, .. } => Some(remaining),
            _ => None,
        }
    }
}

impl<E: StorageEngine> Drop for ParticleStream<'_, E> {
    fn drop(&mut self) {
        let engine = &mut self.fileset.engine;
        let result = match self.state {
            StreamState::Idle => Ok(()),
            StreamState::RootCell { .. } => engine.read_root_cell_end(),
            StreamState::Species { .. } => engine
                .read_species_end()
                .and_then(|()| engine.read_root_cell_end()),
        };
        if let Err(e) = result {
            tracing::warn!("failed to close particle stream: {e}");
        }
    }
}

fn check_buffer(buffer: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(ParticleError::BufferLength {
            buffer,
            expected,
            found,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, ParticleRecord, SpeciesSpec};
    use crate::engine::memory::MemoryEngine;
    use crate::error::ErrorKind;
    use crate::fileset::OpenMode;

    fn fileset() -> Fileset<MemoryEngine> {
        let mut dataset = Dataset::new(
            4,
            vec![SpeciesSpec::new("N-BODY", 3, 0), SpeciesSpec::new("STAR", 3, 1)],
        )
        .unwrap();
        dataset
            .add_particle(1, 0, ParticleRecord::new(10, 0, vec![0.1, 0.2, 0.3], vec![]))
            .unwrap();
        dataset
            .add_particle(1, 0, ParticleRecord::new(11, 0, vec![0.4, 0.5, 0.6], vec![]))
            .unwrap();
        dataset
            .add_particle(1, 1, ParticleRecord::new(20, 2, vec![1.0, 2.0, 3.0], vec![5.0]))
            .unwrap();
        Fileset::from_engine(MemoryEngine::new(dataset), OpenMode::PARTICLES).unwrap()
    }

    #[test]
    fn test_read_one_cell() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        let mut stream = fileset.stream().unwrap();

        let mut counts = [0u32; 2];
        stream.read_root_cell_begin(1, &mut counts).unwrap();
        assert_eq!(counts, [2, 1]);
        assert_eq!(stream.current_sfc(), Some(1));

        stream.read_species_begin(1).unwrap();
        assert_eq!(stream.remaining(), Some(1));
        let mut primary = [0.0; 3];
        let mut secondary = [0.0; 1];
        let info = stream.read_particle(&mut primary, &mut secondary).unwrap();
        assert_eq!(info, ParticleInfo { id: 20, subspecies: 2 });
        assert_eq!(primary, [1.0, 2.0, 3.0]);
        assert_eq!(secondary, [5.0]);
        stream.read_species_end().unwrap();
        stream.read_root_cell_end().unwrap();
        assert_eq!(stream.current_sfc(), None);
    }

    #[test]
    fn test_wrong_state_calls_leave_state_unchanged() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        let mut stream = fileset.stream().unwrap();

        let err = stream.read_species_begin(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = stream.read_root_cell_end().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(stream.current_sfc(), None);

        let mut counts = [0u32; 2];
        stream.read_root_cell_begin(0, &mut counts).unwrap();
        let err = stream.read_root_cell_begin(1, &mut counts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(stream.current_sfc(), Some(0));

        let err = stream.read_particle(&mut [0.0; 3], &mut []).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        stream.read_species_begin(0).unwrap();
        let err = stream.read_root_cell_end().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(stream.current_species(), Some(0));
    }

    #[test]
    fn test_buffer_lengths_checked() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        let mut stream = fileset.stream().unwrap();

        let err = stream.read_root_cell_begin(1, &mut [0u32; 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LengthMismatch);

        stream.read_root_cell_begin(1, &mut [0u32; 2]).unwrap();
        stream.read_species_begin(0).unwrap();
        let err = stream.read_particle(&mut [0.0; 2], &mut []).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LengthMismatch);
        assert_eq!(stream.remaining(), Some(2));
    }

    #[test]
    fn test_over_read_is_invalid_state() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        let mut stream = fileset.stream().unwrap();

        stream.read_root_cell_begin(1, &mut [0u32; 2]).unwrap();
        stream.read_species_begin(1).unwrap();
        stream.read_particle(&mut [0.0; 3], &mut [0.0; 1]).unwrap();
        let err = stream.read_particle(&mut [0.0; 3], &mut [0.0; 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_invalid_species() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        let mut stream = fileset.stream().unwrap();
        stream.read_root_cell_begin(1, &mut [0u32; 2]).unwrap();
        let err = stream.read_species_begin(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpecies);
    }

    #[test]
    fn test_uncached_sfc_rejected() {
        let mut fileset = fileset();
        {
            let mut stream = fileset.stream().unwrap();
            let err = stream.read_root_cell_begin(0, &mut [0u32; 2]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSfcRange);
        }

        fileset.cache_range(0, 1).unwrap();
        let mut stream = fileset.stream().unwrap();
        let err = stream.read_root_cell_begin(2, &mut [0u32; 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSfcRange);
    }

    #[test]
    fn test_dropping_mid_cell_resets_engine() {
        let mut fileset = fileset();
        fileset.cache_range(0, 3).unwrap();
        {
            let mut stream = fileset.stream().unwrap();
            stream.read_root_cell_begin(1, &mut [0u32; 2]).unwrap();
            stream.read_species_begin(0).unwrap();
        }
        let mut stream = fileset.stream().unwrap();
        let mut counts = [0u32; 2];
        stream.read_root_cell_begin(1, &mut counts).unwrap();
        assert_eq!(counts, [2, 1]);
    }

    #[test]
    fn test_stream_requires_particles() {
        let mut fileset = fileset();
        fileset.close_particles().unwrap();
        let err = fileset.stream().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}

//! Storage engine abstraction.
//!
//! A [`StorageEngine`] is the byte-level backend behind a [`Fileset`]. The
//! fileset owns all lifecycle and ordering checks; the engine only has to
//! enumerate header parameters, stage SFC ranges, and decode particle records
//! in the order it is asked for them.
//!
//! Two engines ship with the crate:
//!
//! - [`file::FileEngine`] reads `<prefix>.art` / `<prefix>.pNNN` filesets,
//!   memory-mapped by default
//! - [`memory::MemoryEngine`] serves a [`Dataset`](crate::dataset::Dataset)
//!   held in memory
//!
//! [`Fileset`]: crate::Fileset

pub mod file;
pub mod memory;

use std::ops::Range;

use crate::cache::SfcRange;
use crate::error::Result;
use crate::parameter::{Key, ParameterValue};
use crate::scan::{ParticleRef, ParticleVisitor};
use crate::species::ParticleLayout;
use crate::stream::ParticleInfo;

/// Backend that stores a fileset's header and particles.
///
/// Calls arrive in the order the fileset validated: `open_particles`, then
/// `cache_sfc_range`, then `read_root_cell_begin` / `read_species_begin` /
/// `read_particle` / `read_species_end` / `read_root_cell_end` cycles, then
/// `clear_sfc_cache` and `close_particles`. `read_root_cell_begin` always
/// starts a fresh cell, discarding any cell left unfinished by an aborted scan.
pub trait StorageEngine {
    /// Name used in logs and errors; the path prefix for on-disk filesets.
    fn name(&self) -> &str;

    /// Releases every resource held by the engine.
    ///
    /// # Errors
    ///
    /// Returns the I/O error reported while releasing.
    fn close(&mut self) -> std::io::Result<()>;

    /// Lists header parameters in storage order.
    ///
    /// # Errors
    ///
    /// Returns a format error if the header cannot be decoded.
    fn parameter_keys(&self) -> Result<Vec<Key>>;

    /// Reads the values of one header parameter.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is not in the header.
    fn read_parameter(&self, key: &Key) -> Result<ParameterValue>;

    /// Prepares the particle files described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if a particle file is missing, or a format error if
    /// one is malformed.
    fn open_particles(&mut self, layout: &ParticleLayout) -> Result<()>;

    /// Releases the particle files.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if particles are not open.
    fn close_particles(&mut self) -> Result<()>;

    /// Stages the per-cell offsets of `range`.
    ///
    /// # Errors
    ///
    /// Returns a format error if an offset points outside its file.
    fn cache_sfc_range(&mut self, range: SfcRange) -> Result<()>;

    /// Drops the staged range. A no-op if nothing is staged.
    ///
    /// # Errors
    ///
    /// Engine specific.
    fn clear_sfc_cache(&mut self) -> Result<()>;

    /// Positions at root cell `sfc` and writes per-species counts to `counts`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSfcRange` if `sfc` is not staged.
    fn read_root_cell_begin(&mut self, sfc: i64, counts: &mut [u32]) -> Result<()>;

    /// Finishes the current root cell.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no cell is open.
    fn read_root_cell_end(&mut self) -> Result<()>;

    /// Positions at the first particle of `species` in the current cell.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no cell is open.
    fn read_species_begin(&mut self, species: usize) -> Result<()>;

    /// Finishes the current species.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no species is open.
    fn read_species_end(&mut self) -> Result<()>;

    /// Decodes the next particle into `primary` and `secondary`.
    ///
    /// The slices are exactly as long as the current species' variable counts.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the species is exhausted.
    fn read_particle(&mut self, primary: &mut [f64], secondary: &mut [f32])
    -> Result<ParticleInfo>;

    /// Visits every particle of `species` in the staged `range`, in SFC order
    /// then species order.
    ///
    /// The default walks the stepwise reader; engines with direct access to
    /// their records override it.
    ///
    /// # Errors
    ///
    /// Returns the first error from the engine or the visitor.
    fn scan_range(
        &mut self,
        layout: &ParticleLayout,
        range: SfcRange,
        species: Range<usize>,
        visitor: &mut dyn ParticleVisitor,
    ) -> Result<()> {
        let mut counts = vec![0u32; layout.num_species()];
        let (mut primary, mut secondary) = scratch_buffers(layout);

        for sfc in range.iter() {
            self.read_root_cell_begin(sfc, &mut counts)?;
            for index in species.clone() {
                let shape = &layout.species[index];
                let primary = &mut primary[..shape.num_primary];
                let secondary = &mut secondary[..shape.num_secondary];

                self.read_species_begin(index)?;
                for _ in 0..counts[index] {
                    let info = self.read_particle(primary, secondary)?;
                    visitor.visit(&ParticleRef {
                        sfc,
                        species: index,
                        id: info.id,
                        subspecies: info.subspecies,
                        primary,
                        secondary,
                    })?;
                }
                self.read_species_end()?;
            }
            self.read_root_cell_end()?;
        }
        Ok(())
    }
}

/// Allocates primary/secondary buffers large enough for any species.
pub(crate) fn scratch_buffers(layout: &ParticleLayout) -> (Vec<f64>, Vec<f32>) {
    let primary = layout.species.iter().map(|s| s.num_primary).max().unwrap_or(0);
    let secondary = layout.species.iter().map(|s| s.num_secondary).max().unwrap_or(0);
    (vec![0.0; primary], vec![0.0; secondary])
}

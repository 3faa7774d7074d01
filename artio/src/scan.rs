//! Bulk scans over an SFC range.
//!
//! A scan visits every particle of the selected species in an SFC range,
//! in ascending SFC order and, within a root cell, ascending species order.
//! Each particle is handed to a [`ParticleVisitor`] together with its SFC
//! index and species; a visitor error aborts the scan and is returned as-is.
//!
//! If a range is already cached it must cover the scan. Otherwise the scan
//! stages the range itself and clears it afterwards.
//!
//! # Example
//!
//! ```rust,no_run
//! use artio::scan::{self, ParticleRef, SpeciesFilter};
//! use artio::{Fileset, OpenMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fileset = Fileset::open("data/snapshot", OpenMode::PARTICLES)?;
//!
//! let mut heaviest = 0.0f64;
//! scan::scan(&mut fileset, 0, 511, SpeciesFilter::Only(0), &mut |p: &ParticleRef<'_>| -> artio::Result<()> {
//!     heaviest = heaviest.max(p.primary[6]);
//!     Ok(())
//! })?;
//!
//! let positions = scan::get_positions(&mut fileset, 1, 0, 511)?;
//! println!("{} star positions, heaviest dm {heaviest}", positions.len());
//! # Ok(())
//! # }
//! ```

use std::ops::Range;

use crate::engine::StorageEngine;
use crate::error::{ParticleError, Result, ScanError};
use crate::fileset::Fileset;

/// One particle as seen by a [`ParticleVisitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleRef<'a> {
    /// Root cell holding the particle.
    pub sfc: i64,
    /// Species index.
    pub species: usize,
    /// Particle id.
    pub id: i64,
    /// Subspecies tag.
    pub subspecies: i32,
    /// Double precision variables; positions come first.
    pub primary: &'a [f64],
    /// Single precision variables.
    pub secondary: &'a [f32],
}

/// Receives particles during a scan.
///
/// Any `FnMut(&ParticleRef<'_>) -> Result<()>` closure is a visitor.
pub trait ParticleVisitor {
    /// Visits one particle.
    ///
    /// # Errors
    ///
    /// Returning an error stops the scan.
    fn visit(&mut self, particle: &ParticleRef<'_>) -> Result<()>;
}

impl<F> ParticleVisitor for F
where
    F: FnMut(&ParticleRef<'_>) -> Result<()>,
{
    fn visit(&mut self, particle: &ParticleRef<'_>) -> Result<()> {
        self(particle)
    }
}

/// Which species a scan visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeciesFilter {
    /// Every species.
    #[default]
    All,
    /// A single species.
    Only(usize),
    /// Species `first..=last`.
    Range {
        /// First species visited.
        first: usize,
        /// Last species visited.
        last: usize,
    },
}

impl SpeciesFilter {
    /// Resolves the filter to a half-open species range.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleError::InvalidSpecies`] if the filter names a species
    /// outside `[0, num_species)` or an empty range.
    pub fn resolve(self, num_species: usize) -> Result<Range<usize>> {
        let (first, last) = match self {
            Self::All => return Ok(0..num_species),
            Self::Only(species) => (species, species),
            Self::Range { first, last } => (first, last),
        };
        for species in [first, last] {
            if species >= num_species {
                return Err(ParticleError::InvalidSpecies {
                    species,
                    num_species,
                }
                .into());
            }
        }
        if first > last {
            return Err(ParticleError::InvalidSpecies {
                species: first,
                num_species,
            }
            .into());
        }
        Ok(first..last + 1)
    }
}

/// Visits every selected particle in `start..=end`.
///
/// # Errors
///
/// - `InvalidState` if particles are not open
/// - `InvalidSfcRange` if the range is invalid or not covered by the cache
/// - `InvalidSpecies` if the filter is invalid
/// - any error returned by the visitor or the engine
pub fn scan<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    start: i64,
    end: i64,
    filter: SpeciesFilter,
    visitor: &mut dyn ParticleVisitor,
) -> Result<()> {
    let num_species = fileset
        .particle_state("scan particles")?
        .layout
        .num_species();
    let species = filter.resolve(num_species)?;
    tracing::debug!(start, end, ?species, "scanning particles");
    fileset.with_staged_range(start, end, |engine, layout, range| {
        engine.scan_range(layout, range, species, visitor)
    })
}

struct SpeciesCounter {
    counts: Vec<u64>,
}

impl ParticleVisitor for SpeciesCounter {
    fn visit(&mut self, particle: &ParticleRef<'_>) -> Result<()> {
        self.counts[particle.species] += 1;
        Ok(())
    }
}

/// Counts the particles of each species in `start..=end`.
///
/// # Errors
///
/// Same as [`scan`].
pub fn count_in_range<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    start: i64,
    end: i64,
) -> Result<Vec<u64>> {
    let num_species = fileset
        .particle_state("count particles")?
        .layout
        .num_species();
    let mut counter = SpeciesCounter {
        counts: vec![0; num_species],
    };
    scan(fileset, start, end, SpeciesFilter::All, &mut counter)?;
    Ok(counter.counts)
}

/// Collects particle positions into a caller-provided buffer.
///
/// Positions are the first three primary variables, narrowed to `f32`.
#[derive(Debug)]
pub struct PositionCollector<'a> {
    out: &'a mut [[f32; 3]],
    written: usize,
}

impl<'a> PositionCollector<'a> {
    /// Creates a collector writing into `out`.
    pub fn new(out: &'a mut [[f32; 3]]) -> Self {
        Self { out, written: 0 }
    }

    /// Number of positions written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl ParticleVisitor for PositionCollector<'_> {
    fn visit(&mut self, particle: &ParticleRef<'_>) -> Result<()> {
        let capacity = self.out.len();
        let slot = self.out.get_mut(self.written).ok_or(ScanError::Overflow { capacity })?;
        let [x, y, z, ..] = particle.primary else {
            return Err(ScanError::InvalidSelection {
                species: particle.species,
                reason: format!("{} primary variables, positions need 3", particle.primary.len()),
            }
            .into());
        };
        #[allow(clippy::cast_possible_truncation)]
        let position = [*x as f32, *y as f32, *z as f32];
        *slot = position;
        self.written += 1;
        Ok(())
    }
}

/// Checks that `species` exists and carries positions.
fn check_position_selection<E: StorageEngine>(fileset: &Fileset<E>, species: usize) -> Result<()> {
    let layout = &fileset.particle_state("read positions")?.layout;
    let Some(shape) = layout.species(species) else {
        return Err(ScanError::InvalidSelection {
            species,
            reason: format!("fileset has {} species", layout.num_species()),
        }
        .into());
    };
    if shape.num_primary < 3 {
        return Err(ScanError::InvalidSelection {
            species,
            reason: format!("{} primary variables, positions need 3", shape.num_primary),
        }
        .into());
    }
    Ok(())
}

/// Writes the positions of `species` in `start..=end` to `out`, returning the
/// number written.
///
/// # Errors
///
/// - [`ScanError::InvalidSelection`] if the species does not exist or has
///   fewer than three primary variables
/// - [`ScanError::Overflow`] if `out` is too small; entries written before
///   the overflow are left in place
/// - same as [`scan`] otherwise
pub fn get_positions_into<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    species: usize,
    start: i64,
    end: i64,
    out: &mut [[f32; 3]],
) -> Result<usize> {
    check_position_selection(fileset, species)?;
    let mut collector = PositionCollector::new(out);
    scan(fileset, start, end, SpeciesFilter::Only(species), &mut collector)?;
    Ok(collector.written())
}

/// Returns the positions of `species` in `start..=end`.
///
/// Counts first, then fills an exactly-sized buffer.
///
/// # Errors
///
/// Same as [`get_positions_into`], except that overflow cannot happen.
pub fn get_positions<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    species: usize,
    start: i64,
    end: i64,
) -> Result<Vec<[f32; 3]>> {
    check_position_selection(fileset, species)?;
    let mut counter = SpeciesCounter {
        counts: vec![0; species + 1],
    };
    scan(fileset, start, end, SpeciesFilter::Only(species), &mut counter)?;

    let total = usize::try_from(counter.counts[species]).unwrap_or(usize::MAX);
    let mut positions = vec![[0.0; 3]; total];
    let written = get_positions_into(fileset, species, start, end, &mut positions)?;
    positions.truncate(written);
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_filter_resolution() {
        assert_eq!(SpeciesFilter::All.resolve(3).unwrap(), 0..3);
        assert_eq!(SpeciesFilter::All.resolve(0).unwrap(), 0..0);
        assert_eq!(SpeciesFilter::Only(2).resolve(3).unwrap(), 2..3);
        assert_eq!(
            SpeciesFilter::Range { first: 0, last: 1 }.resolve(3).unwrap(),
            0..2
        );

        for filter in [
            SpeciesFilter::Only(3),
            SpeciesFilter::Range { first: 1, last: 3 },
            SpeciesFilter::Range { first: 2, last: 1 },
        ] {
            let err = filter.resolve(3).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSpecies, "{filter:?}");
        }
    }

    #[test]
    fn test_position_collector_overflow() {
        let mut out = [[0.0f32; 3]; 1];
        let mut collector = PositionCollector::new(&mut out);
        let primary = [1.0, 2.0, 3.0, 4.0];
        let particle = ParticleRef {
            sfc: 0,
            species: 0,
            id: 1,
            subspecies: 0,
            primary: &primary,
            secondary: &[],
        };
        collector.visit(&particle).unwrap();
        let err = collector.visit(&particle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoOverflow);
        assert_eq!(collector.written(), 1);
        assert_eq!(out[0], [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_closure_is_visitor() {
        let mut seen = Vec::new();
        let mut visitor = |p: &ParticleRef<'_>| -> Result<()> {
            seen.push(p.id);
            Ok(())
        };
        let particle = ParticleRef {
            sfc: 4,
            species: 1,
            id: 9,
            subspecies: 0,
            primary: &[],
            secondary: &[],
        };
        visitor.visit(&particle).unwrap();
        assert_eq!(seen, vec![9]);
    }
}

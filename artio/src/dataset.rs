//! In-memory particle datasets.
//!
//! A [`Dataset`] is the writable form of a fileset: species definitions, the
//! particles of each root cell, and any extra header parameters. It is served
//! directly by [`MemoryEngine`](crate::engine::memory::MemoryEngine) and
//! persisted with [`write_fileset`](crate::writer::write_fileset).
//!
//! ```rust
//! use artio::dataset::{Dataset, ParticleRecord, SpeciesSpec};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dataset = Dataset::new(64, vec![SpeciesSpec::new("N-BODY", 6, 1)])?;
//! dataset.add_particle(
//!     12,
//!     0,
//!     ParticleRecord::new(1, 0, vec![0.5, 0.5, 0.5, 0.0, 0.0, 0.0], vec![1.0]),
//! )?;
//! dataset.set_parameter("auni", vec![1.0f64]);
//! assert_eq!(dataset.species_totals(), vec![1]);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ParameterError, ParticleError, Result};
use crate::fileset::{
    MAJOR_VERSION_KEY, MINOR_VERSION_KEY, SFC_TYPE_KEY, SUPPORTED_MAJOR_VERSION,
    SUPPORTED_MINOR_VERSION, SfcType,
};
use crate::parameter::ParameterValue;
use crate::species::{
    FILE_SFC_INDEX_KEY, NUM_FILES_KEY, NUM_PRIMARY_KEY, NUM_ROOT_CELLS_KEY, NUM_SECONDARY_KEY,
    NUM_SPECIES_KEY, SPECIES_LABELS_KEY, SPECIES_TOTALS_KEY,
};

/// Shape of one species.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesSpec {
    /// Species label.
    pub label: String,
    /// Double precision variables per particle.
    pub num_primary: usize,
    /// Single precision variables per particle.
    pub num_secondary: usize,
}

impl SpeciesSpec {
    /// Creates a species shape.
    pub fn new(label: impl Into<String>, num_primary: usize, num_secondary: usize) -> Self {
        Self {
            label: label.into(),
            num_primary,
            num_secondary,
        }
    }
}

/// One stored particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    /// Particle id.
    pub id: i64,
    /// Subspecies tag.
    pub subspecies: i32,
    /// Double precision variables.
    pub primary: Vec<f64>,
    /// Single precision variables.
    pub secondary: Vec<f32>,
}

impl ParticleRecord {
    /// Creates a particle record.
    pub fn new(id: i64, subspecies: i32, primary: Vec<f64>, secondary: Vec<f32>) -> Self {
        Self {
            id,
            subspecies,
            primary,
            secondary,
        }
    }
}

/// A complete particle fileset held in memory.
#[derive(Debug, Clone)]
pub struct Dataset {
    num_root_cells: i64,
    sfc_type: SfcType,
    species: Vec<SpeciesSpec>,
    num_particle_files: usize,
    /// Particles of each non-empty root cell, indexed `[species][n]`.
    cells: BTreeMap<i64, Vec<Vec<ParticleRecord>>>,
    /// Caller-provided parameters; they override derived ones by name.
    extra: IndexMap<String, ParameterValue>,
}

impl Dataset {
    /// Creates an empty dataset with `num_root_cells` root cells.
    ///
    /// A dataset without species has a header but no particle data.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::Corrupted`] if `num_root_cells < 1`.
    pub fn new(num_root_cells: i64, species: Vec<SpeciesSpec>) -> Result<Self> {
        if num_root_cells < 1 {
            return Err(ParameterError::Corrupted {
                name: NUM_ROOT_CELLS_KEY.to_string(),
                reason: format!("{num_root_cells} root cells"),
            }
            .into());
        }
        Ok(Self {
            num_root_cells,
            sfc_type: SfcType::default(),
            species,
            num_particle_files: 1,
            cells: BTreeMap::new(),
            extra: IndexMap::new(),
        })
    }

    /// Sets the curve recorded in the header.
    pub fn set_sfc_type(&mut self, sfc_type: SfcType) {
        self.sfc_type = sfc_type;
    }

    /// Splits the root cells evenly over `count` particle files.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::Corrupted`] if `count` is zero.
    pub fn set_particle_files(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(ParameterError::Corrupted {
                name: NUM_FILES_KEY.to_string(),
                reason: "a particle fileset needs at least one file".to_string(),
            }
            .into());
        }
        self.num_particle_files = count;
        Ok(())
    }

    /// Sets an extra header parameter, replacing a derived one of the same name.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.extra.insert(name.into(), value.into());
    }

    /// Appends a particle to root cell `sfc`.
    ///
    /// # Errors
    ///
    /// - [`ParticleError::InvalidSfcRange`] if `sfc` is not a root cell
    /// - [`ParticleError::InvalidSpecies`] if `species` is out of range
    /// - [`ParticleError::BufferLength`] if the record has the wrong shape
    pub fn add_particle(&mut self, sfc: i64, species: usize, record: ParticleRecord) -> Result<()> {
        if !(0..self.num_root_cells).contains(&sfc) {
            return Err(ParticleError::InvalidSfcRange {
                start: sfc,
                end: sfc,
                num_root_cells: self.num_root_cells,
            }
            .into());
        }
        let shape = self.species.get(species).ok_or(ParticleError::InvalidSpecies {
            species,
            num_species: self.species.len(),
        })?;
        for (buffer, expected, found) in [
            ("primary", shape.num_primary, record.primary.len()),
            ("secondary", shape.num_secondary, record.secondary.len()),
        ] {
            if expected != found {
                return Err(ParticleError::BufferLength {
                    buffer,
                    expected,
                    found,
                }
                .into());
            }
        }

        let num_species = self.species.len();
        self.cells
            .entry(sfc)
            .or_insert_with(|| vec![Vec::new(); num_species])[species]
            .push(record);
        Ok(())
    }

    /// Number of root cells.
    pub fn num_root_cells(&self) -> i64 {
        self.num_root_cells
    }

    /// Species shapes.
    pub fn species(&self) -> &[SpeciesSpec] {
        &self.species
    }

    /// Number of particle files the dataset is split into.
    pub fn num_particle_files(&self) -> usize {
        self.num_particle_files
    }

    /// Particles of `species` in root cell `sfc`; empty for unpopulated cells.
    pub fn particles(&self, sfc: i64, species: usize) -> &[ParticleRecord] {
        self.cells
            .get(&sfc)
            .and_then(|cell| cell.get(species))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Per-species particle counts of root cell `sfc`.
    pub fn cell_counts(&self, sfc: i64) -> Vec<usize> {
        (0..self.species.len())
            .map(|s| self.particles(sfc, s).len())
            .collect()
    }

    /// Total particles of each species.
    pub fn species_totals(&self) -> Vec<u64> {
        let mut totals = vec![0u64; self.species.len()];
        for cell in self.cells.values() {
            for (total, particles) in totals.iter_mut().zip(cell) {
                *total += particles.len() as u64;
            }
        }
        totals
    }

    /// First root cell of each particle file, plus `num_root_cells`.
    pub fn file_sfc_index(&self) -> Vec<i64> {
        let files = self.num_particle_files as i128;
        let cells = i128::from(self.num_root_cells);
        (0..=files)
            .map(|i| i64::try_from(i * cells / files).unwrap_or(self.num_root_cells))
            .collect()
    }

    /// Header parameters in storage order: version and layout parameters
    /// first, then the particle description, then extras.
    pub fn parameters(&self) -> IndexMap<String, ParameterValue> {
        let mut params = IndexMap::new();
        params.insert(
            MAJOR_VERSION_KEY.to_string(),
            ParameterValue::Int32(vec![SUPPORTED_MAJOR_VERSION]),
        );
        params.insert(
            MINOR_VERSION_KEY.to_string(),
            ParameterValue::Int32(vec![SUPPORTED_MINOR_VERSION]),
        );
        params.insert(
            SFC_TYPE_KEY.to_string(),
            ParameterValue::Int32(vec![self.sfc_type.code()]),
        );
        params.insert(
            NUM_ROOT_CELLS_KEY.to_string(),
            ParameterValue::Int64(vec![self.num_root_cells]),
        );

        if !self.species.is_empty() {
            params.insert(
                NUM_FILES_KEY.to_string(),
                ParameterValue::Int32(vec![count_i32(self.num_particle_files)]),
            );
            params.insert(
                FILE_SFC_INDEX_KEY.to_string(),
                ParameterValue::Int64(self.file_sfc_index()),
            );
            params.insert(
                NUM_SPECIES_KEY.to_string(),
                ParameterValue::Int32(vec![count_i32(self.species.len())]),
            );
            params.insert(
                SPECIES_LABELS_KEY.to_string(),
                ParameterValue::String(self.species.iter().map(|s| s.label.clone()).collect()),
            );
            params.insert(
                NUM_PRIMARY_KEY.to_string(),
                ParameterValue::Int32(
                    self.species.iter().map(|s| count_i32(s.num_primary)).collect(),
                ),
            );
            params.insert(
                NUM_SECONDARY_KEY.to_string(),
                ParameterValue::Int32(
                    self.species.iter().map(|s| count_i32(s.num_secondary)).collect(),
                ),
            );
            params.insert(
                SPECIES_TOTALS_KEY.to_string(),
                ParameterValue::Int64(
                    self.species_totals()
                        .into_iter()
                        .map(|t| i64::try_from(t).unwrap_or(i64::MAX))
                        .collect(),
                ),
            );
        }

        for (name, value) in &self.extra {
            params.insert(name.clone(), value.clone());
        }
        params
    }
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

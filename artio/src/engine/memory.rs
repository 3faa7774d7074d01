//! Engine serving a [`Dataset`] from memory.

use indexmap::IndexMap;

use crate::cache::SfcRange;
use crate::dataset::{Dataset, ParticleRecord};
use crate::engine::StorageEngine;
use crate::error::{FilesetError, ParameterError, ParticleError, Result};
use crate::parameter::{Key, ParameterValue};
use crate::species::ParticleLayout;
use crate::stream::ParticleInfo;

/// Read position inside the staged range.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    sfc: Option<i64>,
    species: Option<usize>,
    next: usize,
}

/// Storage engine over an in-memory [`Dataset`].
///
/// Header parameters are generated once, when the engine is created.
#[derive(Debug)]
pub struct MemoryEngine {
    name: String,
    dataset: Dataset,
    parameters: IndexMap<String, ParameterValue>,
    particles_open: bool,
    staged: Option<SfcRange>,
    cursor: Cursor,
}

impl MemoryEngine {
    /// Wraps a dataset.
    pub fn new(dataset: Dataset) -> Self {
        Self::with_name("memory", dataset)
    }

    /// Wraps a dataset under a name used in logs and errors.
    pub fn with_name(name: impl Into<String>, dataset: Dataset) -> Self {
        let parameters = dataset.parameters();
        Self {
            name: name.into(),
            dataset,
            parameters,
            particles_open: false,
            staged: None,
            cursor: Cursor::default(),
        }
    }

    /// Returns the wrapped dataset.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        if self.particles_open {
            Ok(())
        } else {
            Err(ParticleError::NotOpen { operation }.into())
        }
    }

    fn current_species(&self, operation: &'static str) -> Result<(i64, usize)> {
        match (self.cursor.sfc, self.cursor.species) {
            (Some(sfc), Some(species)) => Ok((sfc, species)),
            (Some(_), None) => Err(ParticleError::InvalidState {
                operation,
                state: "no species is open",
            }
            .into()),
            _ => Err(ParticleError::InvalidState {
                operation,
                state: "no root cell is open",
            }
            .into()),
        }
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.particles_open = false;
        self.staged = None;
        self.cursor = Cursor::default();
        Ok(())
    }

    fn parameter_keys(&self) -> Result<Vec<Key>> {
        Ok(self
            .parameters
            .iter()
            .map(|(name, value)| Key::new(name.as_str(), value.parameter_type(), value.len()))
            .collect())
    }

    fn read_parameter(&self, key: &Key) -> Result<ParameterValue> {
        self.parameters
            .get(&key.name)
            .cloned()
            .ok_or_else(|| ParameterError::NotFound { name: key.name.clone() }.into())
    }

    fn open_particles(&mut self, layout: &ParticleLayout) -> Result<()> {
        if self.dataset.species().len() != layout.num_species()
            || self.dataset.num_root_cells() != layout.num_root_cells
        {
            return Err(FilesetError::NotFound {
                prefix: self.name.clone(),
                reason: "header does not describe the stored particles".to_string(),
            }
            .into());
        }
        self.particles_open = true;
        Ok(())
    }

    fn close_particles(&mut self) -> Result<()> {
        self.require_open("close particles")?;
        self.particles_open = false;
        self.staged = None;
        self.cursor = Cursor::default();
        Ok(())
    }

    fn cache_sfc_range(&mut self, range: SfcRange) -> Result<()> {
        self.require_open("cache an sfc range")?;
        self.staged = Some(range);
        Ok(())
    }

    fn clear_sfc_cache(&mut self) -> Result<()> {
        self.staged = None;
        self.cursor = Cursor::default();
        Ok(())
    }

    fn read_root_cell_begin(&mut self, sfc: i64, counts: &mut [u32]) -> Result<()> {
        self.require_open("begin a root cell")?;
        if !self.staged.is_some_and(|r| r.contains(sfc)) {
            return Err(ParticleError::SfcNotCached {
                sfc,
                cached: self.staged,
            }
            .into());
        }
        for (species, count) in counts.iter_mut().enumerate() {
            let len = self.dataset.particles(sfc, species).len();
            *count = u32::try_from(len).map_err(|_| ParameterError::Corrupted {
                name: "num_particles_per_species".to_string(),
                reason: format!("{len} particles in root cell {sfc}"),
            })?;
        }
        self.cursor = Cursor {
            sfc: Some(sfc),
            species: None,
            next: 0,
        };
        Ok(())
    }

    fn read_root_cell_end(&mut self) -> Result<()> {
        self.cursor = Cursor::default();
        Ok(())
    }

    fn read_species_begin(&mut self, species: usize) -> Result<()> {
        if self.cursor.sfc.is_none() {
            return Err(ParticleError::InvalidState {
                operation: "begin a species",
                state: "no root cell is open",
            }
            .into());
        }
        self.cursor.species = Some(species);
        self.cursor.next = 0;
        Ok(())
    }

    fn read_species_end(&mut self) -> Result<()> {
        self.cursor.species = None;
        self.cursor.next = 0;
        Ok(())
    }

    fn read_particle(
        &mut self,
        primary: &mut [f64],
        secondary: &mut [f32],
    ) -> Result<ParticleInfo> {
        const OPERATION: &str = "read a particle";
        let (sfc, species) = self.current_species(OPERATION)?;
        let ParticleRecord {
            id,
            subspecies,
            primary: stored_primary,
            secondary: stored_secondary,
        } = self
            .dataset
            .particles(sfc, species)
            .get(self.cursor.next)
            .ok_or(ParticleError::InvalidState {
                operation: OPERATION,
                state: "every particle of the species has been read",
            })?;

        for (buffer, expected, found) in [
            ("primary", stored_primary.len(), primary.len()),
            ("secondary", stored_secondary.len(), secondary.len()),
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
        primary.copy_from_slice(stored_primary);
        secondary.copy_from_slice(stored_secondary);
        let info = ParticleInfo {
            id: *id,
            subspecies: *subspecies,
        };
        self.cursor.next += 1;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SpeciesSpec;
    use crate::error::ErrorKind;

    #[test]
    fn test_parameters_enumerated_in_order() {
        let dataset = Dataset::new(4, vec![SpeciesSpec::new("N-BODY", 3, 0)]).unwrap();
        let engine = MemoryEngine::new(dataset);
        let keys = engine.parameter_keys().unwrap();
        assert_eq!(keys[0].name, "ARTIO_MAJOR_VERSION");
        for key in &keys {
            let value = engine.read_parameter(key).unwrap();
            assert_eq!(value.len(), key.length);
        }

        let missing = Key::new("missing", crate::parameter::ParameterType::Int32, 1);
        assert_eq!(engine.read_parameter(&missing).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_reads_require_open_particles() {
        let dataset = Dataset::new(4, vec![SpeciesSpec::new("N-BODY", 3, 0)]).unwrap();
        let mut engine = MemoryEngine::new(dataset);
        let err = engine.cache_sfc_range(SfcRange::new(0, 3).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = engine.read_root_cell_begin(0, &mut [0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}

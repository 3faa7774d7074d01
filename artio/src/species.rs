//! Particle species layout discovered from the header.
//!
//! The header describes particles through several parallel arrays indexed by
//! species (`num_primary_variables`, `num_secondary_variables`, labels,
//! totals). [`ParticleLayout::from_parameters`] reads them once and folds them
//! into one [`Species`] record per species, so nothing downstream has to keep
//! the arrays aligned by hand.

use serde::{Deserialize, Serialize};

use crate::error::{FilesetError, ParameterError, Result};
use crate::parameter::ParameterStore;

/// Header parameter naming the number of particle species.
pub const NUM_SPECIES_KEY: &str = "num_particle_species";
/// Header parameter naming the number of particle files.
pub const NUM_FILES_KEY: &str = "num_particle_files";
/// Per-species count of double precision variables.
pub const NUM_PRIMARY_KEY: &str = "num_primary_variables";
/// Per-species count of single precision variables.
pub const NUM_SECONDARY_KEY: &str = "num_secondary_variables";
/// First SFC index stored in each particle file, plus one past the end.
pub const FILE_SFC_INDEX_KEY: &str = "particle_file_sfc_index";
/// Optional per-species labels.
pub const SPECIES_LABELS_KEY: &str = "particle_species_labels";
/// Per-species particle totals.
pub const SPECIES_TOTALS_KEY: &str = "num_particles_per_species";
/// Older name for the per-species particle totals.
pub const LEGACY_SPECIES_TOTALS_KEY: &str = "particle_species_num";
/// Number of root cells in the fileset.
pub const NUM_ROOT_CELLS_KEY: &str = "num_root_cells";

/// One particle species and the shape of its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Species {
    /// Index in `[0, num_species)`.
    pub index: usize,
    /// Label from the header, if the fileset has one.
    pub label: Option<String>,
    /// Number of double precision (primary) variables per particle.
    pub num_primary: usize,
    /// Number of single precision (secondary) variables per particle.
    pub num_secondary: usize,
    /// Total particles of this species in the whole fileset, if recorded.
    pub total_particles: Option<u64>,
}

/// Everything the particle reader needs to know about a fileset's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleLayout {
    /// Number of root cells; valid SFC indices are `0..num_root_cells`.
    pub num_root_cells: i64,
    /// Species records, indexed by species.
    pub species: Vec<Species>,
    /// First SFC of each particle file, with a trailing end marker.
    pub file_sfc_index: Vec<i64>,
}

impl ParticleLayout {
    /// Builds the layout from header parameters.
    ///
    /// # Errors
    ///
    /// - [`FilesetError::NotFound`] if the header has no particle description
    /// - [`ParameterError::Corrupted`] if the arrays disagree with each other
    pub fn from_parameters(prefix: &str, store: &ParameterStore) -> Result<Self> {
        if !store.has_key(NUM_SPECIES_KEY) || !store.has_key(NUM_FILES_KEY) {
            return Err(FilesetError::NotFound {
                prefix: prefix.to_string(),
                reason: "header has no particle data".to_string(),
            }
            .into());
        }

        let num_root_cells = store.get_scalar_int64(NUM_ROOT_CELLS_KEY)?;
        if num_root_cells < 1 {
            return Err(corrupted(NUM_ROOT_CELLS_KEY, format!("{num_root_cells} root cells")));
        }

        let num_species = count(NUM_SPECIES_KEY, store.get_scalar_int32(NUM_SPECIES_KEY)?)?;
        let num_files = count(NUM_FILES_KEY, store.get_scalar_int32(NUM_FILES_KEY)?)?;
        if num_files == 0 {
            return Err(FilesetError::NotFound {
                prefix: prefix.to_string(),
                reason: "header declares zero particle files".to_string(),
            }
            .into());
        }

        let primary = per_species_counts(store, NUM_PRIMARY_KEY, num_species)?;
        let secondary = per_species_counts(store, NUM_SECONDARY_KEY, num_species)?;

        let labels = match store.value(SPECIES_LABELS_KEY) {
            Some(_) => {
                let key = store.describe(SPECIES_LABELS_KEY)?;
                let labels = store.get_string(&key)?;
                check_length(SPECIES_LABELS_KEY, labels.len(), num_species)?;
                labels.into_iter().map(Some).collect()
            }
            None => vec![None; num_species],
        };

        let totals = match species_totals(store)? {
            Some(totals) => {
                check_length(SPECIES_TOTALS_KEY, totals.len(), num_species)?;
                totals
                    .into_iter()
                    .map(|t| {
                        u64::try_from(t).map(Some).map_err(|_| {
                            corrupted(SPECIES_TOTALS_KEY, format!("negative total {t}"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => vec![None; num_species],
        };

        let file_sfc_index = store.get_integers(FILE_SFC_INDEX_KEY)?;
        check_length(FILE_SFC_INDEX_KEY, file_sfc_index.len(), num_files + 1)?;
        if file_sfc_index.windows(2).any(|w| w[0] > w[1])
            || file_sfc_index[0] != 0
            || file_sfc_index[num_files] != num_root_cells
        {
            return Err(corrupted(
                FILE_SFC_INDEX_KEY,
                format!("{file_sfc_index:?} does not partition 0..{num_root_cells}"),
            ));
        }

        let species = labels
            .into_iter()
            .zip(totals)
            .enumerate()
            .map(|(index, (label, total_particles))| Species {
                index,
                label,
                num_primary: primary[index],
                num_secondary: secondary[index],
                total_particles,
            })
            .collect();

        Ok(Self {
            num_root_cells,
            species,
            file_sfc_index,
        })
    }

    /// Returns the number of species.
    pub fn num_species(&self) -> usize {
        self.species.len()
    }

    /// Returns the number of particle files.
    pub fn num_files(&self) -> usize {
        self.file_sfc_index.len() - 1
    }

    /// Returns the species record, if `index` is in range.
    pub fn species(&self, index: usize) -> Option<&Species> {
        self.species.get(index)
    }

    /// Returns the index of the particle file holding `sfc`, or `None` if the
    /// index lies outside every file.
    pub fn find_file(&self, sfc: i64) -> Option<usize> {
        let files = self.num_files();
        if sfc < self.file_sfc_index[0] || sfc >= self.file_sfc_index[files] {
            return None;
        }
        // Last file whose first SFC is <= sfc. Empty files share their start
        // with the next file, so this skips them.
        Some(self.file_sfc_index[..files].partition_point(|&start| start <= sfc) - 1)
    }
}

/// Reads the per-species totals, falling back to the legacy parameter name.
fn species_totals(store: &ParameterStore) -> Result<Option<Vec<i64>>> {
    for name in [SPECIES_TOTALS_KEY, LEGACY_SPECIES_TOTALS_KEY] {
        if store.has_key(name) {
            return store.get_integers(name).map(Some);
        }
    }
    Ok(None)
}

fn per_species_counts(
    store: &ParameterStore,
    name: &str,
    num_species: usize,
) -> Result<Vec<usize>> {
    let values = store.get_integers(name)?;
    check_length(name, values.len(), num_species)?;
    values
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| corrupted(name, format!("negative count {v}"))))
        .collect()
}

fn count(name: &str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| corrupted(name, format!("negative count {value}")))
}

fn check_length(name: &str, found: usize, expected: usize) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(corrupted(name, format!("has {found} entries, expected {expected}")))
    }
}

fn corrupted(name: &str, reason: String) -> crate::error::ArtioError {
    ParameterError::Corrupted {
        name: name.to_string(),
        reason,
    }
    .into()
}

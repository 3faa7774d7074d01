//! Writes a [`Dataset`] as an on-disk fileset.
//!
//! The writer is the inverse of [`FileEngine`](crate::engine::file::FileEngine):
//! one header file plus one particle file per SFC partition, laid out as
//! described in [`format`](crate::format). Each file is encoded in memory and
//! written in one call.

use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::dataset::Dataset;
use crate::error::{FormatError, Result};
use crate::format::{
    PARTICLE_HEADER_SIZE, ParticleFileHeader, encode_header, header_path, particle_path,
};

/// Writes `dataset` to `<prefix>.art` and, if it has species,
/// `<prefix>.p000`, `<prefix>.p001`, ...
///
/// Existing files are overwritten.
///
/// # Errors
///
/// Returns [`FormatError::Io`] if a file cannot be written, or
/// [`FormatError::Corrupted`] if a parameter does not fit the header layout.
///
/// # Example
///
/// ```rust,no_run
/// use artio::dataset::{Dataset, ParticleRecord, SpeciesSpec};
/// use artio::writer::write_fileset;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut dataset = Dataset::new(8, vec![SpeciesSpec::new("N-BODY", 3, 0)])?;
/// dataset.add_particle(0, 0, ParticleRecord::new(1, 0, vec![0.1, 0.2, 0.3], vec![]))?;
/// write_fileset("out/snapshot", &dataset)?;
/// # Ok(())
/// # }
/// ```
pub fn write_fileset<P: AsRef<Path>>(prefix: P, dataset: &Dataset) -> Result<()> {
    let prefix = prefix.as_ref();
    let path = header_path(prefix);
    let path_str = path.display().to_string();
    let parameters = dataset.parameters();
    let header = encode_header(&path_str, parameters.iter().map(|(n, v)| (n.as_str(), v)))?;
    write_file(&path, &header)?;

    if dataset.species().is_empty() {
        tracing::debug!(prefix = %prefix.display(), "wrote header-only fileset");
        return Ok(());
    }

    let index = dataset.file_sfc_index();
    for (file, bounds) in index.windows(2).enumerate() {
        let path = particle_path(prefix, file);
        let path_str = path.display().to_string();
        let bytes = encode_particle_file(&path_str, dataset, bounds[0], bounds[1])?;
        write_file(&path, &bytes)?;
    }

    tracing::debug!(
        prefix = %prefix.display(),
        files = dataset.num_particle_files(),
        "wrote fileset"
    );
    Ok(())
}

/// Encodes the root cells `first..end` into one particle file.
fn encode_particle_file(path: &str, dataset: &Dataset, first: i64, end: i64) -> Result<Vec<u8>> {
    let io = |source| FormatError::Io {
        path: path.to_string(),
        source,
    };
    let num_cells = end - first;
    let mut out = Vec::new();
    ParticleFileHeader {
        first_sfc: first,
        num_cells,
    }
    .encode(&mut out);

    // Offset table is filled in once each record's position is known.
    let table_start = out.len();
    debug_assert_eq!(table_start as u64, PARTICLE_HEADER_SIZE);
    out.resize(table_start + 8 * usize::try_from(num_cells).unwrap_or(0), 0);

    for (slot, sfc) in (first..end).enumerate() {
        let offset = out.len() as u64;
        let at = table_start + 8 * slot;
        out[at..at + 8].copy_from_slice(&offset.to_le_bytes());

        let counts = dataset.cell_counts(sfc);
        for &count in &counts {
            let count = u32::try_from(count).map_err(|_| FormatError::Corrupted {
                path: path.to_string(),
                reason: format!("{count} particles of one species in root cell {sfc}"),
            })?;
            out.write_u32::<LittleEndian>(count).map_err(io)?;
        }
        for species in 0..counts.len() {
            for record in dataset.particles(sfc, species) {
                out.write_i64::<LittleEndian>(record.id).map_err(io)?;
                out.write_i32::<LittleEndian>(record.subspecies).map_err(io)?;
                for &v in &record.primary {
                    out.write_f64::<LittleEndian>(v).map_err(io)?;
                }
                for &v in &record.secondary {
                    out.write_f32::<LittleEndian>(v).map_err(io)?;
                }
            }
        }
    }
    Ok(out)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|source| {
        FormatError::Io {
            path: path.display().to_string(),
            source,
        }
        .into()
    })
}

//! Engine reading on-disk filesets.
//!
//! The header is read eagerly when the engine opens. Particle files are
//! opened by [`StorageEngine::open_particles`], memory-mapped unless the
//! configuration asks for buffered reads. Caching a range copies the range's
//! slice of each file's offset table, so cell lookups during a read never
//! touch the table again.
//!
//! # Safety
//!
//! Particle files are mapped read-only. Every access goes through a
//! bounds-checked reader, so a file truncated by another process after
//! validation yields a format error rather than an out-of-bounds read of the
//! map itself. Mutation of a mapped file by another process is not guarded
//! against.

use std::fs::File;
use std::io;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::cache::SfcRange;
use crate::engine::{StorageEngine, scratch_buffers};
use crate::error::{FilesetError, FormatError, ParameterError, ParticleError, Result};
use crate::format::{
    ByteReader, PARTICLE_HEADER_SIZE, ParticleFileHeader, decode_header, header_path,
    particle_path, record_size,
};
use crate::parameter::{Key, ParameterValue};
use crate::scan::{ParticleRef, ParticleVisitor};
use crate::species::ParticleLayout;
use crate::stream::ParticleInfo;

/// Configuration for [`FileEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEngineConfig {
    /// Memory-map particle files instead of reading them into memory.
    pub use_mmap: bool,
}

impl Default for FileEngineConfig {
    fn default() -> Self {
        Self { use_mmap: true }
    }
}

/// Bytes of one particle file.
enum FileBytes {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Buffered(bytes) => bytes,
        }
    }
}

struct ParticleFile {
    path: String,
    bytes: FileBytes,
    header: ParticleFileHeader,
}

/// Offsets of the staged range, one per root cell.
struct StagedRange {
    range: SfcRange,
    cells: Vec<(usize, usize)>,
}

impl StagedRange {
    fn cell(&self, sfc: i64) -> Option<(usize, usize)> {
        if !self.range.contains(sfc) {
            return None;
        }
        let index = usize::try_from(sfc - self.range.start()).ok()?;
        self.cells.get(index).copied()
    }
}

/// Position of the stepwise reader.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    Idle,
    Cell { file: usize, offset: usize },
    Species { file: usize, offset: usize, pos: usize, species: usize, remaining: u32 },
}

struct OpenParticles {
    files: Vec<ParticleFile>,
    layout: ParticleLayout,
    staged: Option<StagedRange>,
    counts: Vec<u32>,
    cursor: Cursor,
}

impl OpenParticles {
    fn staged_cell(&self, sfc: i64) -> Result<(usize, usize)> {
        self.staged
            .as_ref()
            .and_then(|staged| staged.cell(sfc))
            .ok_or_else(|| {
                ParticleError::SfcNotCached {
                    sfc,
                    cached: self.staged.as_ref().map(|s| s.range),
                }
                .into()
            })
    }

    /// Byte offset of the first record of `species` in the cell at `offset`.
    fn species_offset(&self, offset: usize, species: usize) -> usize {
        let skipped: u64 = self.layout.species[..species]
            .iter()
            .zip(&self.counts)
            .map(|(shape, &count)| {
                record_size(shape.num_primary, shape.num_secondary) * u64::from(count)
            })
            .sum();
        offset + 4 * self.counts.len() + usize::try_from(skipped).unwrap_or(usize::MAX)
    }
}

/// Storage engine for `<prefix>.art` / `<prefix>.pNNN` filesets.
pub struct FileEngine {
    prefix: PathBuf,
    name: String,
    config: FileEngineConfig,
    parameters: Vec<(Key, ParameterValue)>,
    particles: Option<OpenParticles>,
}

impl FileEngine {
    /// Opens the header of the fileset at `prefix`.
    ///
    /// # Errors
    ///
    /// - [`FilesetError::NotFound`] if `<prefix>.art` does not exist
    /// - [`FormatError`] if it cannot be read or decoded
    pub fn open<P: AsRef<Path>>(prefix: P, config: FileEngineConfig) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        let name = prefix.display().to_string();
        let path = header_path(&prefix);
        let path_str = path.display().to_string();

        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FilesetError::NotFound {
                prefix: name.clone(),
                reason: format!("no header file {path_str}"),
            }
            .into(),
            _ => crate::error::ArtioError::from(FormatError::Io {
                path: path_str.clone(),
                source: e,
            }),
        })?;
        let parameters = decode_header(&path_str, &bytes)?;
        tracing::debug!(path = %path_str, parameters = parameters.len(), "read header file");

        Ok(Self {
            prefix,
            name,
            config,
            parameters,
            particles: None,
        })
    }

    fn open_file(&self, index: usize, layout: &ParticleLayout) -> Result<ParticleFile> {
        let path = particle_path(&self.prefix, index);
        let path_str = path.display().to_string();
        let io_error = |source| FormatError::Io {
            path: path_str.clone(),
            source,
        };

        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FilesetError::NotFound {
                prefix: self.name.clone(),
                reason: format!("no particle file {path_str}"),
            }
            .into(),
            _ => crate::error::ArtioError::from(io_error(e)),
        })?;

        let bytes = if self.config.use_mmap {
            // SAFETY: The map is read-only and every read through it is
            // bounds-checked against its length.
            FileBytes::Mapped(unsafe { Mmap::map(&file) }.map_err(io_error)?)
        } else {
            FileBytes::Buffered(std::fs::read(&path).map_err(io_error)?)
        };

        let header = ParticleFileHeader::decode(&path_str, &bytes)?;
        let expected_first = layout.file_sfc_index[index];
        let expected_cells = layout.file_sfc_index[index + 1] - expected_first;
        if header.first_sfc != expected_first || header.num_cells != expected_cells {
            return Err(FormatError::Corrupted {
                path: path_str,
                reason: format!(
                    "file holds {} cells from sfc {}, \
                     header expects {expected_cells} from {expected_first}",
                    header.num_cells, header.first_sfc
                ),
            }
            .into());
        }

        tracing::debug!(
            path = %path_str,
            cells = header.num_cells,
            mapped = self.config.use_mmap,
            "opened particle file"
        );
        Ok(ParticleFile {
            path: path_str,
            bytes,
            header,
        })
    }

    fn open_particles_mut(&mut self, operation: &'static str) -> Result<&mut OpenParticles> {
        self.particles
            .as_mut()
            .ok_or_else(|| ParticleError::NotOpen { operation }.into())
    }
}

impl StorageEngine for FileEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> io::Result<()> {
        self.particles = None;
        Ok(())
    }

    fn parameter_keys(&self) -> Result<Vec<Key>> {
        Ok(self.parameters.iter().map(|(key, _)| key.clone()).collect())
    }

    fn read_parameter(&self, key: &Key) -> Result<ParameterValue> {
        self.parameters
            .iter()
            .find(|(k, _)| k.name == key.name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| ParameterError::NotFound { name: key.name.clone() }.into())
    }

    fn open_particles(&mut self, layout: &ParticleLayout) -> Result<()> {
        let files = (0..layout.num_files())
            .map(|index| self.open_file(index, layout))
            .collect::<Result<Vec<_>>>()?;
        self.particles = Some(OpenParticles {
            files,
            layout: layout.clone(),
            staged: None,
            counts: vec![0; layout.num_species()],
            cursor: Cursor::Idle,
        });
        Ok(())
    }

    fn close_particles(&mut self) -> Result<()> {
        self.open_particles_mut("close particles")?;
        self.particles = None;
        Ok(())
    }

    fn cache_sfc_range(&mut self, range: SfcRange) -> Result<()> {
        let particles = self.open_particles_mut("cache an sfc range")?;
        let mut cells = Vec::with_capacity(usize::try_from(range.len()).unwrap_or(0));

        for sfc in range.iter() {
            let file_index = particles.layout.find_file(sfc).ok_or(ParticleError::InvalidSfcRange {
                start: range.start(),
                end: range.end(),
                num_root_cells: particles.layout.num_root_cells,
            })?;
            let file = &particles.files[file_index];
            let slot = u64::try_from(sfc - file.header.first_sfc).unwrap_or(u64::MAX);
            let table_at = usize::try_from(PARTICLE_HEADER_SIZE + 8 * slot).unwrap_or(usize::MAX);
            let offset = ByteReader::new(&file.path, &file.bytes, table_at).read_u64()?;

            let offset = usize::try_from(offset)
                .ok()
                .filter(|&o| o < file.bytes.len())
                .ok_or_else(|| FormatError::Corrupted {
                    path: file.path.clone(),
                    reason: format!("root cell {sfc} at offset {offset} is outside the file"),
                })?;
            cells.push((file_index, offset));
        }

        tracing::trace!(%range, cells = cells.len(), "staged cell offsets");
        particles.staged = Some(StagedRange { range, cells });
        particles.cursor = Cursor::Idle;
        Ok(())
    }

    fn clear_sfc_cache(&mut self) -> Result<()> {
        if let Some(particles) = self.particles.as_mut() {
            particles.staged = None;
            particles.cursor = Cursor::Idle;
        }
        Ok(())
    }

    fn read_root_cell_begin(&mut self, sfc: i64, counts: &mut [u32]) -> Result<()> {
        let particles = self.open_particles_mut("begin a root cell")?;
        let (file, offset) = particles.staged_cell(sfc)?;
        let data = &particles.files[file];
        ByteReader::new(&data.path, &data.bytes, offset).read_u32_into(&mut particles.counts)?;
        counts.copy_from_slice(&particles.counts);
        particles.cursor = Cursor::Cell { file, offset };
        Ok(())
    }

    fn read_root_cell_end(&mut self) -> Result<()> {
        let particles = self.open_particles_mut("end a root cell")?;
        particles.cursor = Cursor::Idle;
        Ok(())
    }

    fn read_species_begin(&mut self, species: usize) -> Result<()> {
        let particles = self.open_particles_mut("begin a species")?;
        let Cursor::Cell { file, offset } = particles.cursor else {
            return Err(ParticleError::InvalidState {
                operation: "begin a species",
                state: "no root cell is open",
            }
            .into());
        };
        particles.cursor = Cursor::Species {
            file,
            offset,
            pos: particles.species_offset(offset, species),
            species,
            remaining: particles.counts[species],
        };
        Ok(())
    }

    fn read_species_end(&mut self) -> Result<()> {
        let particles = self.open_particles_mut("end a species")?;
        if let Cursor::Species { file, offset, .. } = particles.cursor {
            particles.cursor = Cursor::Cell { file, offset };
        }
        Ok(())
    }

    fn read_particle(
        &mut self,
        primary: &mut [f64],
        secondary: &mut [f32],
    ) -> Result<ParticleInfo> {
        const OPERATION: &str = "read a particle";
        let particles = self.open_particles_mut(OPERATION)?;
        let Cursor::Species {
            file,
            offset,
            pos,
            species,
            remaining,
        } = particles.cursor
        else {
            return Err(ParticleError::InvalidState {
                operation: OPERATION,
                state: "no species is open",
            }
            .into());
        };
        if remaining == 0 {
            return Err(ParticleError::InvalidState {
                operation: OPERATION,
                state: "every particle of the species has been read",
            }
            .into());
        }

        let data = &particles.files[file];
        let mut reader = ByteReader::new(&data.path, &data.bytes, pos);
        let id = reader.read_i64()?;
        let subspecies = reader.read_i32()?;
        reader.read_f64_into(primary)?;
        reader.read_f32_into(secondary)?;

        particles.cursor = Cursor::Species {
            file,
            offset,
            pos: reader.position(),
            species,
            remaining: remaining - 1,
        };
        Ok(ParticleInfo { id, subspecies })
    }

    fn scan_range(
        &mut self,
        layout: &ParticleLayout,
        range: SfcRange,
        species: Range<usize>,
        visitor: &mut dyn ParticleVisitor,
    ) -> Result<()> {
        let particles = self.open_particles_mut("scan particles")?;
        let (mut primary, mut secondary) = scratch_buffers(layout);
        let mut counts = vec![0u32; layout.num_species()];

        for sfc in range.iter() {
            let (file, offset) = particles.staged_cell(sfc)?;
            let data = &particles.files[file];
            let mut reader = ByteReader::new(&data.path, &data.bytes, offset);
            reader.read_u32_into(&mut counts)?;

            for (index, shape) in layout.species[..species.end].iter().enumerate() {
                let count = counts[index];
                if index < species.start {
                    let size = record_size(shape.num_primary, shape.num_secondary);
                    reader.skip(size * u64::from(count))?;
                    continue;
                }
                let primary = &mut primary[..shape.num_primary];
                let secondary = &mut secondary[..shape.num_secondary];
                for _ in 0..count {
                    let id = reader.read_i64()?;
                    let subspecies = reader.read_i32()?;
                    reader.read_f64_into(primary)?;
                    reader.read_f32_into(secondary)?;
                    visitor.visit(&ParticleRef {
                        sfc,
                        species: index,
                        id,
                        subspecies,
                        primary,
                        secondary,
                    })?;
                }
            }
        }
        Ok(())
    }
}

//! Integration tests for the cell-by-cell particle stream reader.
//!
//! Each test writes the same deterministic dataset to a temporary fileset
//! and compares what the reader returns against the in-memory original.

use artio::dataset::{Dataset, ParticleRecord, SpeciesSpec};
use artio::scan::count_in_range;
use artio::writer::write_fileset;
use artio::{
    ErrorKind, FileEngine, FileEngineConfig, Fileset, MemoryEngine, OpenMode, SfcRange,
    StorageEngine,
};
use tempfile::{TempDir, tempdir};

const ROOT_CELLS: i64 = 16;

/// Three species with uneven counts, spread over three particle files.
fn populated_dataset() -> Dataset {
    let mut dataset = Dataset::new(
        ROOT_CELLS,
        vec![
            SpeciesSpec::new("N-BODY", 6, 1),
            SpeciesSpec::new("STAR", 7, 3),
            SpeciesSpec::new("TRACER", 2, 0),
        ],
    )
    .unwrap();
    dataset.set_particle_files(3).unwrap();

    let mut id = 0i64;
    for sfc in 0..ROOT_CELLS {
        for species in 0..3usize {
            let shape = &dataset.species()[species];
            let (num_primary, num_secondary) = (shape.num_primary, shape.num_secondary);
            let count = (sfc as usize * (species + 1) + species) % 4;
            for n in 0..count {
                let primary = (0..num_primary)
                    .map(|v| sfc as f64 + species as f64 * 0.1 + n as f64 * 0.01 + v as f64 * 100.0)
                    .collect();
                let secondary = (0..num_secondary).map(|v| v as f32 + 0.5).collect();
                dataset
                    .add_particle(
                        sfc,
                        species,
                        ParticleRecord::new(id, species as i32 * 10, primary, secondary),
                    )
                    .unwrap();
                id += 1;
            }
        }
    }
    dataset
}

fn write_populated(name: &str) -> (TempDir, std::path::PathBuf, Dataset) {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join(name);
    let dataset = populated_dataset();
    write_fileset(&prefix, &dataset).unwrap();
    (dir, prefix, dataset)
}

/// Reads every particle of `start..=end` with the stream reader.
fn read_all<E: StorageEngine>(
    fileset: &mut Fileset<E>,
    start: i64,
    end: i64,
) -> Vec<(i64, usize, ParticleRecord)> {
    let layout = fileset.particle_layout().cloned().unwrap();
    let mut out = Vec::new();
    let mut counts = vec![0u32; layout.num_species()];
    let mut stream = fileset.stream().unwrap();

    for sfc in start..=end {
        stream.read_root_cell_begin(sfc, &mut counts).unwrap();
        for (index, species) in layout.species.iter().enumerate() {
            stream.read_species_begin(index).unwrap();
            for _ in 0..counts[index] {
                let mut primary = vec![0.0; species.num_primary];
                let mut secondary = vec![0.0; species.num_secondary];
                let info = stream.read_particle(&mut primary, &mut secondary).unwrap();
                out.push((
                    sfc,
                    index,
                    ParticleRecord::new(info.id, info.subspecies, primary, secondary),
                ));
            }
            stream.read_species_end().unwrap();
        }
        stream.read_root_cell_end().unwrap();
    }
    out
}

fn expected(dataset: &Dataset, start: i64, end: i64) -> Vec<(i64, usize, ParticleRecord)> {
    let mut out = Vec::new();
    for sfc in start..=end {
        for species in 0..dataset.species().len() {
            for record in dataset.particles(sfc, species) {
                out.push((sfc, species, record.clone()));
            }
        }
    }
    out
}

#[test]
fn test_stream_reads_every_particle() {
    let (_dir, prefix, dataset) = write_populated("stream");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();

    fileset.cache_range(0, ROOT_CELLS - 1).unwrap();
    let read = read_all(&mut fileset, 0, ROOT_CELLS - 1);
    assert_eq!(read, expected(&dataset, 0, ROOT_CELLS - 1));
    fileset.clear_cache().unwrap();
    fileset.close().unwrap();
}

#[test]
fn test_stream_across_file_boundary() {
    let (_dir, prefix, dataset) = write_populated("boundary");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    let index = fileset.particle_layout().unwrap().file_sfc_index.clone();
    assert_eq!(index, vec![0, 5, 10, 16]);

    fileset.cache_range(3, 11).unwrap();
    assert_eq!(read_all(&mut fileset, 3, 11), expected(&dataset, 3, 11));
}

#[test]
fn test_buffered_engine_reads_the_same() {
    let (_dir, prefix, dataset) = write_populated("buffered");
    let mut fileset = Fileset::open_with(
        &prefix,
        OpenMode::PARTICLES,
        FileEngineConfig { use_mmap: false },
    )
    .unwrap();

    fileset.cache_range(0, ROOT_CELLS - 1).unwrap();
    assert_eq!(
        read_all(&mut fileset, 0, ROOT_CELLS - 1),
        expected(&dataset, 0, ROOT_CELLS - 1)
    );
}

#[test]
fn test_memory_engine_reads_the_same() {
    let dataset = populated_dataset();
    let expected = expected(&dataset, 0, ROOT_CELLS - 1);
    let mut fileset =
        Fileset::from_engine(MemoryEngine::new(dataset), OpenMode::PARTICLES).unwrap();

    fileset.cache_range(0, ROOT_CELLS - 1).unwrap();
    assert_eq!(read_all(&mut fileset, 0, ROOT_CELLS - 1), expected);
}

#[test]
fn test_counts_equal_stream_visits() {
    let (_dir, prefix, _dataset) = write_populated("counts");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();

    for (start, end) in [(0, ROOT_CELLS - 1), (0, 0), (4, 9), (15, 15)] {
        let counts = count_in_range(&mut fileset, start, end).unwrap();

        fileset.cache_range(start, end).unwrap();
        let read = read_all(&mut fileset, start, end);
        fileset.clear_cache().unwrap();

        let mut visited = vec![0u64; counts.len()];
        for (_, species, _) in &read {
            visited[*species] += 1;
        }
        assert_eq!(counts, visited, "{start}..={end}");
        assert_eq!(counts.iter().sum::<u64>(), read.len() as u64);
    }
}

#[test]
fn test_species_end_skips_unread_particles() {
    let (_dir, prefix, dataset) = write_populated("skip");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    fileset.cache_range(0, ROOT_CELLS - 1).unwrap();

    // Root cell 3 holds 3 N-BODY and 3 STAR particles.
    let mut stream = fileset.stream().unwrap();
    let mut counts = [0u32; 3];
    stream.read_root_cell_begin(3, &mut counts).unwrap();
    assert_eq!(counts, [3, 3, 3]);

    stream.read_species_begin(0).unwrap();
    stream.read_particle(&mut [0.0; 6], &mut [0.0; 1]).unwrap();
    stream.read_species_end().unwrap();

    let mut primary = [0.0; 7];
    let mut secondary = [0.0; 3];
    stream.read_species_begin(1).unwrap();
    let info = stream.read_particle(&mut primary, &mut secondary).unwrap();
    let first_star = &dataset.particles(3, 1)[0];
    assert_eq!(info.id, first_star.id);
    assert_eq!(primary.to_vec(), first_star.primary);
    assert_eq!(secondary.to_vec(), first_star.secondary);
}

#[test]
fn test_species_in_any_order() {
    let (_dir, prefix, dataset) = write_populated("order");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    fileset.cache_range(7, 7).unwrap();

    let mut stream = fileset.stream().unwrap();
    let mut counts = [0u32; 3];
    stream.read_root_cell_begin(7, &mut counts).unwrap();

    for species in [2usize, 0] {
        let shape = &dataset.species()[species];
        stream.read_species_begin(species).unwrap();
        for record in dataset.particles(7, species) {
            let mut primary = vec![0.0; shape.num_primary];
            let mut secondary = vec![0.0; shape.num_secondary];
            let info = stream.read_particle(&mut primary, &mut secondary).unwrap();
            assert_eq!(info.id, record.id);
            assert_eq!(primary, record.primary);
        }
        stream.read_species_end().unwrap();
    }
    stream.read_root_cell_end().unwrap();
}

#[test]
fn test_illegal_sequences_then_close() {
    let (_dir, prefix, _dataset) = write_populated("illegal");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    fileset.cache_range(0, 3).unwrap();

    {
        let mut stream = fileset.stream().unwrap();
        let mut counts = [0u32; 3];

        for err in [
            stream.read_species_begin(0).unwrap_err(),
            stream.read_species_end().unwrap_err(),
            stream.read_root_cell_end().unwrap_err(),
            stream.read_particle(&mut [0.0; 6], &mut [0.0; 1]).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidState);
            assert!(err.kind().is_contract_violation());
        }

        stream.read_root_cell_begin(1, &mut counts).unwrap();
        let err = stream.read_root_cell_begin(2, &mut counts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        stream.read_species_begin(0).unwrap();
        let err = stream.read_species_begin(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        for _ in 0..counts[0] {
            stream.read_particle(&mut [0.0; 6], &mut [0.0; 1]).unwrap();
        }
        let err = stream.read_particle(&mut [0.0; 6], &mut [0.0; 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    let err = fileset.open_particles().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    fileset.close().unwrap();
}

#[test]
fn test_cache_bounds_leave_prior_state() {
    let (_dir, prefix, _dataset) = write_populated("bounds");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    fileset.cache_range(2, 5).unwrap();
    let active = SfcRange::new(2, 5);

    for (start, end, kind) in [
        (0, ROOT_CELLS, ErrorKind::InvalidSfcRange),
        (-1, 3, ErrorKind::InvalidSfcRange),
        (6, 4, ErrorKind::InvalidSfcRange),
        (6, 7, ErrorKind::InvalidState),
    ] {
        let err = fileset.cache_range(start, end).unwrap_err();
        assert_eq!(err.kind(), kind, "{start}..={end}");
        assert_eq!(fileset.cached_range(), active);
    }

    let mut stream = fileset.stream().unwrap();
    let mut counts = [0u32; 3];
    let err = stream.read_root_cell_begin(6, &mut counts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSfcRange);
    stream.read_root_cell_begin(5, &mut counts).unwrap();
}

#[test]
fn test_reading_after_clear_fails() {
    let (_dir, prefix, _dataset) = write_populated("cleared");
    let mut fileset = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    {
        let _guard = fileset.cached(0, 3).unwrap();
    }

    let mut stream = fileset.stream().unwrap();
    let err = stream.read_root_cell_begin(0, &mut [0u32; 3]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSfcRange);
}

#[test]
fn test_file_engine_is_the_default() {
    let (_dir, prefix, _dataset) = write_populated("default");
    let fileset: Fileset<FileEngine> = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap();
    assert!(fileset.prefix().ends_with("default"));
}

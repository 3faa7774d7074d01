//! Integration tests for opening, releasing and closing filesets.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use artio::dataset::{Dataset, ParticleRecord, SpeciesSpec};
use artio::scan;
use artio::writer::write_fileset;
use artio::{
    ErrorKind, Fileset, Key, MemoryEngine, OpenMode, ParameterValue, ParticleInfo,
    ParticleLayout, Result, SfcRange, StorageEngine,
};
use tempfile::tempdir;

type CallLog = Rc<RefCell<Vec<&'static str>>>;

/// Delegates to a [`MemoryEngine`], logs lifecycle calls, and fails to close.
struct FailingClose {
    inner: MemoryEngine,
    log: CallLog,
}

impl FailingClose {
    fn new(dataset: Dataset) -> (Self, CallLog) {
        let log = CallLog::default();
        let engine = Self {
            inner: MemoryEngine::with_name("failing", dataset),
            log: Rc::clone(&log),
        };
        (engine, log)
    }
}

impl StorageEngine for FailingClose {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.borrow_mut().push("close");
        self.inner.close()?;
        Err(io::Error::other("device went away"))
    }

    fn parameter_keys(&self) -> Result<Vec<Key>> {
        self.inner.parameter_keys()
    }

    fn read_parameter(&self, key: &Key) -> Result<ParameterValue> {
        self.inner.read_parameter(key)
    }

    fn open_particles(&mut self, layout: &ParticleLayout) -> Result<()> {
        self.log.borrow_mut().push("open_particles");
        self.inner.open_particles(layout)
    }

    fn close_particles(&mut self) -> Result<()> {
        self.log.borrow_mut().push("close_particles");
        self.inner.close_particles()
    }

    fn cache_sfc_range(&mut self, range: SfcRange) -> Result<()> {
        self.log.borrow_mut().push("cache");
        self.inner.cache_sfc_range(range)
    }

    fn clear_sfc_cache(&mut self) -> Result<()> {
        self.log.borrow_mut().push("clear");
        self.inner.clear_sfc_cache()
    }

    fn read_root_cell_begin(&mut self, sfc: i64, counts: &mut [u32]) -> Result<()> {
        self.inner.read_root_cell_begin(sfc, counts)
    }

    fn read_root_cell_end(&mut self) -> Result<()> {
        self.inner.read_root_cell_end()
    }

    fn read_species_begin(&mut self, species: usize) -> Result<()> {
        self.inner.read_species_begin(species)
    }

    fn read_species_end(&mut self) -> Result<()> {
        self.inner.read_species_end()
    }

    fn read_particle(
        &mut self,
        primary: &mut [f64],
        secondary: &mut [f32],
    ) -> Result<ParticleInfo> {
        self.inner.read_particle(primary, secondary)
    }
}

fn small_dataset() -> Dataset {
    let mut dataset = Dataset::new(4, vec![SpeciesSpec::new("N-BODY", 3, 0)]).unwrap();
    dataset.set_particle_files(2).unwrap();
    for sfc in 0..4 {
        let record = ParticleRecord::new(sfc, 0, vec![sfc as f64, 0.5, 0.25], vec![]);
        dataset.add_particle(sfc, 0, record).unwrap();
    }
    dataset
}

#[test]
fn test_close_failure_is_io_error() {
    let (engine, log) = FailingClose::new(small_dataset());
    let mut fileset = Fileset::from_engine(engine, OpenMode::PARTICLES).unwrap();
    fileset.cache_range(0, 3).unwrap();
    assert_eq!(scan::count_in_range(&mut fileset, 1, 2).unwrap(), vec![2]);

    let err = fileset.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(err.to_string().contains("failing"));

    // Released exactly once, even though close failed.
    assert_eq!(
        *log.borrow(),
        vec!["open_particles", "cache", "clear", "close_particles", "close"]
    );
}

#[test]
fn test_drop_without_close_releases() {
    let (engine, log) = FailingClose::new(small_dataset());
    {
        let mut fileset = Fileset::from_engine(engine, OpenMode::PARTICLES).unwrap();
        fileset.cache_range(1, 2).unwrap();
    }
    assert_eq!(
        *log.borrow(),
        vec!["open_particles", "cache", "clear", "close_particles", "close"]
    );
}

#[test]
fn test_failed_open_releases_engine() {
    let mut dataset = small_dataset();
    dataset.set_parameter("ARTIO_MAJOR_VERSION", vec![2i32]);
    let (engine, log) = FailingClose::new(dataset);

    let err = Fileset::from_engine(engine, OpenMode::PARTICLES).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    assert_eq!(*log.borrow(), vec!["close"]);
}

#[test]
fn test_header_only_fileset() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("header_only");
    let mut dataset = Dataset::new(8, vec![]).unwrap();
    dataset.set_parameter("auni", vec![1.0f64]);
    write_fileset(&prefix, &dataset).unwrap();

    let fileset = Fileset::open(&prefix, OpenMode::HEADER).unwrap();
    assert!(!fileset.has_particles());
    assert!(!fileset.particles_open());
    assert!(fileset.species().is_empty());
    fileset.close().unwrap();

    let err = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = Fileset::open(&prefix, OpenMode::GRID).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_grid_mode_needs_grid_files() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("grid");
    let mut dataset = small_dataset();
    dataset.set_parameter("num_grid_files", vec![1i32]);
    write_fileset(&prefix, &dataset).unwrap();

    let fileset = Fileset::open(&prefix, OpenMode::GRID | OpenMode::PARTICLES).unwrap();
    assert!(fileset.has_grid());
    assert!(fileset.particles_open());
    assert!(fileset.mode().contains(OpenMode::GRID));
}

#[test]
fn test_missing_particle_file() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("missing");
    write_fileset(&prefix, &small_dataset()).unwrap();
    std::fs::remove_file(dir.path().join("missing.p001")).unwrap();

    let fileset = Fileset::open(&prefix, OpenMode::HEADER).unwrap();
    assert!(fileset.has_particles());
    drop(fileset);

    let err = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_truncated_particle_file() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("truncated");
    write_fileset(&prefix, &small_dataset()).unwrap();
    let path = dir.path().join("truncated.p000");
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..10]).unwrap();

    let err = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
}

#[test]
fn test_swapped_particle_files() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("swapped");
    write_fileset(&prefix, &small_dataset()).unwrap();
    let first = dir.path().join("swapped.p000");
    let second = dir.path().join("swapped.p001");
    let scratch = dir.path().join("swapped.tmp");
    std::fs::rename(&first, &scratch).unwrap();
    std::fs::rename(&second, &first).unwrap();
    std::fs::rename(&scratch, &second).unwrap();

    let err = Fileset::open(&prefix, OpenMode::PARTICLES).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
}

#[test]
fn test_corrupted_header_file() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("garbage");
    std::fs::write(dir.path().join("garbage.art"), b"not a header").unwrap();

    let err = Fileset::open(&prefix, OpenMode::HEADER).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
}

#[test]
fn test_particles_reopen_after_close() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("reopen");
    write_fileset(&prefix, &small_dataset()).unwrap();

    let mut fileset = Fileset::open(&prefix, OpenMode::HEADER).unwrap();
    let err = fileset.close_particles().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = fileset.cache_range(0, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    fileset.open_particles().unwrap();
    fileset.cache_range(0, 1).unwrap();
    fileset.close_particles().unwrap();
    assert!(fileset.cached_range().is_none());

    fileset.open_particles().unwrap();
    assert_eq!(scan::count_in_range(&mut fileset, 0, 3).unwrap(), vec![4]);
    fileset.close().unwrap();
}

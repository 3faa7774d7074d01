//! Error types for the artio fileset reader.

use thiserror::Error;

use crate::cache::SfcRange;
use crate::parameter::ParameterType;

/// The main error type for all artio operations.
///
/// Each variant wraps the error enum of one area of the reader. Use
/// [`ArtioError::kind`] to classify an error without matching on the
/// nested enums.
#[derive(Error, Debug)]
pub enum ArtioError {
    /// Error opening, closing, or changing the state of a fileset.
    #[error("fileset error: {0}")]
    Fileset(#[from] FilesetError),

    /// Error looking up or decoding a header parameter.
    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterError),

    /// Error in the particle cache or stream reader.
    #[error("particle error: {0}")]
    Particle(#[from] ParticleError),

    /// Error during a bulk scan over an SFC range.
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// Error decoding or encoding fileset bytes.
    #[error("format error: {0}")]
    Format(#[from] FormatError),
}

/// Classification of every [`ArtioError`].
///
/// Callers that only care about *what kind* of failure happened match on
/// this instead of the nested error enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A parameter key, dataset prefix, or data subsystem is absent.
    NotFound,
    /// An accessor type does not match the parameter's declared type.
    TypeMismatch,
    /// A buffer length does not match the declared array length.
    LengthMismatch,
    /// An SFC index or range lies outside the valid domain.
    InvalidSfcRange,
    /// A species index lies outside `[0, num_species)`.
    InvalidSpecies,
    /// A bulk query selection is not satisfiable.
    InvalidSelection,
    /// An operation was invoked outside its required state.
    InvalidState,
    /// A scan would write more results than the destination holds.
    IoOverflow,
    /// The store reports internally inconsistent metadata.
    Corrupted,
    /// An I/O failure in the storage engine.
    Io,
    /// The fileset was written by a newer, unsupported format version.
    VersionMismatch,
}

impl ErrorKind {
    /// Returns `true` for kinds that indicate a caller bug rather than a
    /// data condition: wrong-sized buffers and out-of-order calls.
    pub fn is_contract_violation(self) -> bool {
        matches!(self, Self::LengthMismatch | Self::InvalidState)
    }
}

impl ArtioError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fileset(e) => e.kind(),
            Self::Parameter(e) => e.kind(),
            Self::Particle(e) => e.kind(),
            Self::Scan(e) => e.kind(),
            Self::Format(e) => e.kind(),
        }
    }
}

/// Errors that can occur when opening, closing, or reconfiguring a fileset.
#[derive(Error, Debug)]
pub enum FilesetError {
    /// The prefix does not resolve to a dataset valid for the requested mode.
    #[error("fileset '{prefix}' not found: {reason}")]
    NotFound {
        /// The fileset prefix that was requested.
        prefix: String,
        /// What was missing.
        reason: String,
    },

    /// A lifecycle operation was called out of order.
    #[error("cannot {operation}: {reason}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// Why the fileset is in the wrong state.
        reason: &'static str,
    },

    /// The fileset was written by a newer major version of the format.
    #[error("fileset version {major}.{minor} is newer than supported version {supported}.x")]
    VersionMismatch {
        /// Major version found in the header.
        major: i32,
        /// Minor version found in the header.
        minor: i32,
        /// Highest major version this reader understands.
        supported: i32,
    },

    /// The storage engine failed to release the fileset.
    #[error("failed to close fileset '{prefix}': {source}")]
    CloseFailed {
        /// The fileset prefix.
        prefix: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FilesetError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::CloseFailed { .. } => ErrorKind::Io,
        }
    }
}

/// Errors that can occur when discovering or fetching header parameters.
#[derive(Error, Debug)]
pub enum ParameterError {
    /// No parameter with this name exists in the fileset.
    #[error("parameter '{name}' not found")]
    NotFound {
        /// The requested parameter name.
        name: String,
    },

    /// The accessor does not match the parameter's declared type.
    #[error("parameter '{name}' has type {found}, requested {requested}")]
    TypeMismatch {
        /// The parameter name.
        name: String,
        /// The type the accessor reads.
        requested: ParameterType,
        /// The type the parameter was declared with.
        found: ParameterType,
    },

    /// A caller-side length expectation does not match the stored array.
    #[error("parameter '{name}' has {found} values, expected {expected}")]
    LengthMismatch {
        /// The parameter name.
        name: String,
        /// The length the caller expected.
        expected: usize,
        /// The length actually stored.
        found: usize,
    },

    /// The store's own metadata for this parameter is inconsistent.
    #[error("parameter '{name}' is corrupted: {reason}")]
    Corrupted {
        /// The parameter name.
        name: String,
        /// Description of the inconsistency.
        reason: String,
    },
}

impl ParameterError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            Self::Corrupted { .. } => ErrorKind::Corrupted,
        }
    }
}

/// Errors raised by the SFC cache and the particle stream reader.
#[derive(Error, Debug)]
pub enum ParticleError {
    /// The particle subsystem is not open.
    #[error("cannot {operation}: particles are not open")]
    NotOpen {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The requested SFC range is empty, reversed, or outside the root cells.
    #[error("invalid sfc range {start}..={end} (valid: 0..{num_root_cells})")]
    InvalidSfcRange {
        /// Requested first SFC index.
        start: i64,
        /// Requested last SFC index (inclusive).
        end: i64,
        /// Number of root cells in the fileset.
        num_root_cells: i64,
    },

    /// An SFC index lies outside the currently cached range.
    #[error("sfc {sfc} is outside the cached range {cached:?}")]
    SfcNotCached {
        /// The requested SFC index.
        sfc: i64,
        /// The active cached range, if any.
        cached: Option<SfcRange>,
    },

    /// A range is already cached; it must be cleared before caching another.
    #[error("sfc range {active} is already cached; clear it before caching {requested}")]
    AlreadyCached {
        /// The currently active range.
        active: SfcRange,
        /// The range the caller tried to cache.
        requested: SfcRange,
    },

    /// A stream reader call was made outside its required state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the reader was in.
        state: &'static str,
    },

    /// The species index is out of bounds.
    #[error("invalid species {species} (fileset has {num_species})")]
    InvalidSpecies {
        /// The requested species index.
        species: usize,
        /// Number of species in the fileset.
        num_species: usize,
    },

    /// A caller-provided buffer is not sized as the contract requires.
    #[error("{buffer} buffer has length {found}, expected {expected}")]
    BufferLength {
        /// Which buffer was wrong.
        buffer: &'static str,
        /// Required length.
        expected: usize,
        /// Provided length.
        found: usize,
    },
}

impl ParticleError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOpen { .. } | Self::AlreadyCached { .. } | Self::InvalidState { .. } => {
                ErrorKind::InvalidState
            }
            Self::InvalidSfcRange { .. } | Self::SfcNotCached { .. } => ErrorKind::InvalidSfcRange,
            Self::InvalidSpecies { .. } => ErrorKind::InvalidSpecies,
            Self::BufferLength { .. } => ErrorKind::LengthMismatch,
        }
    }
}

/// Errors raised by bulk scans.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The selection cannot be satisfied for this fileset.
    #[error("invalid selection of species {species}: {reason}")]
    InvalidSelection {
        /// The selected species.
        species: usize,
        /// Why the selection is invalid.
        reason: String,
    },

    /// The destination is smaller than the number of matching particles.
    #[error("scan output overflow: destination holds {capacity} entries")]
    Overflow {
        /// Capacity of the destination buffer.
        capacity: usize,
    },
}

impl ScanError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSelection { .. } => ErrorKind::InvalidSelection,
            Self::Overflow { .. } => ErrorKind::IoOverflow,
        }
    }
}

/// Errors decoding or encoding the on-disk fileset representation.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Failed to read or write a fileset file.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file does not start with the expected magic bytes.
    #[error("'{path}' has invalid magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The file path.
        path: String,
        /// The magic this file type requires.
        expected: [u8; 4],
        /// The bytes actually found.
        found: [u8; 4],
    },

    /// The file ends before a record it declares.
    #[error("'{path}' is truncated: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// The file path.
        path: String,
        /// Byte offset of the failed read.
        offset: u64,
        /// Number of bytes that were needed.
        needed: u64,
    },

    /// The file's contents are internally inconsistent.
    #[error("'{path}' is corrupted: {reason}")]
    Corrupted {
        /// The file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },
}

impl FormatError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::BadMagic { .. } | Self::Truncated { .. } | Self::Corrupted { .. } => {
                ErrorKind::Corrupted
            }
        }
    }
}

/// Type alias for `Result<T, ArtioError>`.
pub type Result<T> = std::result::Result<T, ArtioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err: ArtioError = ParameterError::NotFound {
            name: "num_root_cells".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ArtioError = ParticleError::AlreadyCached {
            active: SfcRange::new(0, 3).unwrap(),
            requested: SfcRange::new(4, 5).unwrap(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err: ArtioError = ScanError::Overflow { capacity: 2 }.into();
        assert_eq!(err.kind(), ErrorKind::IoOverflow);

        let err: ArtioError = FormatError::Truncated {
            path: "x.p000".to_string(),
            offset: 24,
            needed: 8,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_contract_violations() {
        assert!(ErrorKind::InvalidState.is_contract_violation());
        assert!(ErrorKind::LengthMismatch.is_contract_violation());
        assert!(!ErrorKind::NotFound.is_contract_violation());
        assert!(!ErrorKind::Corrupted.is_contract_violation());
    }

    #[test]
    fn test_error_messages() {
        let err: ArtioError = ParticleError::InvalidSfcRange {
            start: 5,
            end: 2,
            num_root_cells: 8,
        }
        .into();
        assert!(err.to_string().contains("invalid sfc range 5..=2"));

        let err: ArtioError = ParameterError::TypeMismatch {
            name: "sfc_type".to_string(),
            requested: ParameterType::Float64,
            found: ParameterType::Int32,
        }
        .into();
        assert!(err.to_string().contains("has type int32, requested float64"));
    }
}

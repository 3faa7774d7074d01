//! SFC range cache.
//!
//! Before particles can be streamed, the caller stages a contiguous range of
//! root cells with [`Fileset::cache_range`]. Staging lets the engine load the
//! per-cell offsets for the range once; the stream reader then refuses any
//! root cell outside it.
//!
//! At most one range is active at a time. Caching a second range while one is
//! active fails with `InvalidState`; clear the first one explicitly. The
//! [`CacheGuard`] returned by [`Fileset::cached`] clears the range on drop.

use std::fmt;
use std::ops::{Deref, DerefMut, RangeInclusive};

use serde::{Deserialize, Serialize};

use crate::engine::StorageEngine;
use crate::error::{ParticleError, Result};
use crate::fileset::Fileset;
use crate::species::ParticleLayout;

/// A non-empty, inclusive range of SFC indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSfcRange")]
pub struct SfcRange {
    start: i64,
    end: i64,
}

/// Unchecked serialized form of [`SfcRange`].
#[derive(Deserialize)]
struct RawSfcRange {
    start: i64,
    end: i64,
}

impl TryFrom<RawSfcRange> for SfcRange {
    type Error = String;

    fn try_from(raw: RawSfcRange) -> std::result::Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
            .ok_or_else(|| format!("sfc range {}..={} is reversed", raw.start, raw.end))
    }
}

impl SfcRange {
    /// Creates the range `start..=end`, or `None` if `start > end`.
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// First SFC index in the range.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Last SFC index in the range (inclusive).
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of root cells in the range, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// Always `false`; ranges hold at least one cell.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns `true` if `sfc` lies in the range.
    pub fn contains(&self, sfc: i64) -> bool {
        self.start <= sfc && sfc <= self.end
    }

    /// Returns `true` if every index of `other` lies in this range.
    pub fn covers(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Iterates over the SFC indices in order.
    pub fn iter(&self) -> RangeInclusive<i64> {
        self.start..=self.end
    }
}

impl fmt::Display for SfcRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Checks `start..=end` against the fileset's root cells.
pub(crate) fn validate_range(layout: &ParticleLayout, start: i64, end: i64) -> Result<SfcRange> {
    SfcRange::new(start, end)
        .filter(|r| r.start >= 0 && r.end < layout.num_root_cells)
        .ok_or_else(|| {
            ParticleError::InvalidSfcRange {
                start,
                end,
                num_root_cells: layout.num_root_cells,
            }
            .into()
        })
}

impl<E: StorageEngine> Fileset<E> {
    /// Stages the root cells `start..=end` for reading.
    ///
    /// # Errors
    ///
    /// - [`ParticleError::NotOpen`] if particles are not open
    /// - [`ParticleError::InvalidSfcRange`] if the range is reversed or lies
    ///   outside `0..num_root_cells`
    /// - [`ParticleError::AlreadyCached`] if another range is active
    pub fn cache_range(&mut self, start: i64, end: i64) -> Result<()> {
        let state = self
            .particles
            .as_mut()
            .ok_or(ParticleError::NotOpen {
                operation: "cache an sfc range",
            })?;
        let range = validate_range(&state.layout, start, end)?;
        if let Some(active) = state.active_range {
            return Err(ParticleError::AlreadyCached {
                active,
                requested: range,
            }
            .into());
        }

        self.engine.cache_sfc_range(range)?;
        state.active_range = Some(range);
        tracing::debug!(%range, "cached sfc range");
        Ok(())
    }

    /// Drops the active range, if any. Safe to call at any time.
    ///
    /// # Errors
    ///
    /// Returns an engine error if releasing the staged range fails. The range
    /// is no longer active either way.
    pub fn clear_cache(&mut self) -> Result<()> {
        let Some(state) = self.particles.as_mut() else {
            return Ok(());
        };
        let Some(range) = state.active_range.take() else {
            return Ok(());
        };
        tracing::debug!(%range, "cleared sfc range");
        self.engine.clear_sfc_cache()
    }

    /// Returns the active cached range.
    pub fn cached_range(&self) -> Option<SfcRange> {
        self.particles.as_ref().and_then(|p| p.active_range)
    }

    /// Caches `start..=end` and returns a guard that clears it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`cache_range`](Self::cache_range).
    pub fn cached(&mut self, start: i64, end: i64) -> Result<CacheGuard<'_, E>> {
        self.cache_range(start, end)?;
        Ok(CacheGuard { fileset: self })
    }

    /// Runs `f` over `start..=end` with the range staged in the engine.
    ///
    /// If a range is already active it must cover the request. Otherwise the
    /// range is staged for the duration of `f` and cleared afterwards.
    pub(crate) fn with_staged_range<T>(
        &mut self,
        start: i64,
        end: i64,
        f: impl FnOnce(&mut E, &ParticleLayout, SfcRange) -> Result<T>,
    ) -> Result<T> {
        let state = self
            .particles
            .as_ref()
            .ok_or(ParticleError::NotOpen {
                operation: "scan particles",
            })?;
        let range = validate_range(&state.layout, start, end)?;

        match state.active_range {
            Some(active) if active.covers(&range) => f(&mut self.engine, &state.layout, range),
            Some(active) => Err(ParticleError::SfcNotCached {
                sfc: if active.contains(range.start) {
                    range.end
                } else {
                    range.start
                },
                cached: Some(active),
            }
            .into()),
            None => {
                self.engine.cache_sfc_range(range)?;
                let result = f(&mut self.engine, &state.layout, range);
                let cleared = self.engine.clear_sfc_cache();
                let value = result?;
                cleared?;
                Ok(value)
            }
        }
    }
}

/// A cached range that is cleared when the guard goes out of scope.
///
/// Dereferences to the [`Fileset`], so reads go through the guard.
///
/// ```rust,no_run
/// use artio::{Fileset, OpenMode};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut fileset = Fileset::open("data/snapshot", OpenMode::PARTICLES)?;
/// {
///     let mut cached = fileset.cached(0, 63)?;
///     let counts = artio::scan::count_in_range(&mut *cached, 0, 63)?;
///     println!("{counts:?}");
/// }
/// assert!(fileset.cached_range().is_none());
/// # Ok(())
/// # }
/// ```
pub struct CacheGuard<'f, E: StorageEngine> {
    fileset: &'f mut Fileset<E>,
}

impl<E: StorageEngine> CacheGuard<'_, E> {
    /// Clears the range now, returning any engine error.
    ///
    /// # Errors
    ///
    /// Same as [`Fileset::clear_cache`].
    pub fn release(mut self) -> Result<()> {
        self.fileset.clear_cache()
    }
}

impl<E: StorageEngine> Deref for CacheGuard<'_, E> {
    type Target = Fileset<E>;

    fn deref(&self) -> &Fileset<E> {
        self.fileset
    }
}

impl<E: StorageEngine> DerefMut for CacheGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut Fileset<E> {
        self.fileset
    }
}

impl<E: StorageEngine> Drop for CacheGuard<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.fileset.clear_cache() {
            tracing::warn!("failed to clear sfc cache: {e}");
        }
    }
}

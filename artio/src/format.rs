//! On-disk fileset layout.
//!
//! A fileset is a header file plus one file per particle partition, all
//! sharing a path prefix:
//!
//! ```text
//! <prefix>.art     <- header parameters
//! <prefix>.p000    <- particles for the first SFC partition
//! <prefix>.p001
//! ...
//! ```
//!
//! All integers and floats are little-endian.
//!
//! # Header file
//!
//! ```text
//! [0..4)    magic "ARTH"
//! [4..8)    u32 format version
//! [8..12)   u32 parameter count
//! then per parameter:
//!           u16 name length | name bytes | u8 type tag | u32 array length | payload
//! ```
//!
//! String payloads are a `u16` byte length plus bytes per element; char
//! payloads are raw bytes; numeric payloads are packed arrays.
//!
//! # Particle file
//!
//! ```text
//! [0..4)    magic "ARTP"
//! [4..8)    u32 format version
//! [8..16)   i64 first SFC in this file
//! [16..24)  i64 number of root cells in this file
//! [24..)    u64 absolute offset of each root cell record
//! then per root cell:
//!           u32 particle count per species
//!           per species, per particle:
//!             i64 id | i32 subspecies | f64 x num_primary | f32 x num_secondary
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{FormatError, Result};
use crate::parameter::{Key, MAX_STRING_LENGTH, ParameterType, ParameterValue};

/// Magic bytes opening a header file.
pub const HEADER_MAGIC: [u8; 4] = *b"ARTH";
/// Magic bytes opening a particle file.
pub const PARTICLE_MAGIC: [u8; 4] = *b"ARTP";
/// Layout version written and accepted by this crate.
pub const FORMAT_VERSION: u32 = 1;
/// Size of the fixed particle file header, before the offset table.
pub const PARTICLE_HEADER_SIZE: u64 = 24;

/// Bytes of a single particle record with the given variable counts.
pub fn record_size(num_primary: usize, num_secondary: usize) -> u64 {
    (8 + 4 + 8 * num_primary + 4 * num_secondary) as u64
}

/// Path of the header file for `prefix`.
pub fn header_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".art")
}

/// Path of particle file `index` for `prefix`.
pub fn particle_path(prefix: &Path, index: usize) -> PathBuf {
    with_suffix(prefix, &format!(".p{index:03}"))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Bounds-checked little-endian reader over a byte slice.
pub(crate) struct ByteReader<'a> {
    path: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(path: &'a str, data: &'a [u8], pos: usize) -> Self {
        Self { path, data, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(FormatError::Truncated {
                path: self.path.to_string(),
                offset: self.pos as u64,
                needed: len as u64,
            }
            .into());
        };
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn skip(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| FormatError::Truncated {
            path: self.path.to_string(),
            offset: self.pos as u64,
            needed: len,
        })?;
        self.take(len).map(|_| ())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub(crate) fn read_u32_into(&mut self, out: &mut [u32]) -> Result<()> {
        LittleEndian::read_u32_into(self.take(out.len() * 4)?, out);
        Ok(())
    }

    pub(crate) fn read_f64_into(&mut self, out: &mut [f64]) -> Result<()> {
        LittleEndian::read_f64_into(self.take(out.len() * 8)?, out);
        Ok(())
    }

    pub(crate) fn read_f32_into(&mut self, out: &mut [f32]) -> Result<()> {
        LittleEndian::read_f32_into(self.take(out.len() * 4)?, out);
        Ok(())
    }

    fn read_magic(&mut self, expected: [u8; 4]) -> Result<()> {
        let bytes = self.take(4)?;
        if bytes == expected {
            return Ok(());
        }
        let mut found = [0u8; 4];
        found.copy_from_slice(bytes);
        Err(FormatError::BadMagic {
            path: self.path.to_string(),
            expected,
            found,
        }
        .into())
    }

    fn read_version(&mut self) -> Result<()> {
        let version = self.read_u32()?;
        if version == FORMAT_VERSION {
            Ok(())
        } else {
            Err(self.corrupted(format!("unsupported layout version {version}")))
        }
    }

    fn corrupted(&self, reason: String) -> crate::error::ArtioError {
        FormatError::Corrupted {
            path: self.path.to_string(),
            reason,
        }
        .into()
    }
}

/// Encodes header parameters in order.
///
/// # Errors
///
/// Returns [`FormatError::Corrupted`] if a name or string does not fit its
/// length prefix.
pub fn encode_header<'a, I>(path: &str, entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a ParameterValue)>,
    I::IntoIter: ExactSizeIterator,
{
    let entries = entries.into_iter();
    let mut out = Vec::new();
    let io = |source| FormatError::Io {
        path: path.to_string(),
        source,
    };

    out.extend_from_slice(&HEADER_MAGIC);
    out.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(io)?;
    out.write_u32::<LittleEndian>(length_u32(path, "parameter count", entries.len())?)
        .map_err(io)?;

    for (name, value) in entries {
        let name_len = u16::try_from(name.len()).map_err(|_| FormatError::Corrupted {
            path: path.to_string(),
            reason: format!("parameter name of {} bytes", name.len()),
        })?;
        out.write_u16::<LittleEndian>(name_len).map_err(io)?;
        out.extend_from_slice(name.as_bytes());
        out.write_u8(value.parameter_type().tag()).map_err(io)?;
        out.write_u32::<LittleEndian>(length_u32(path, name, value.len())?)
            .map_err(io)?;

        match value {
            ParameterValue::String(values) => {
                for s in values {
                    if s.len() > MAX_STRING_LENGTH {
                        return Err(FormatError::Corrupted {
                            path: path.to_string(),
                            reason: format!("string in '{name}' exceeds {MAX_STRING_LENGTH} bytes"),
                        }
                        .into());
                    }
                    // MAX_STRING_LENGTH fits in u16.
                    out.write_u16::<LittleEndian>(s.len() as u16).map_err(io)?;
                    out.extend_from_slice(s.as_bytes());
                }
            }
            ParameterValue::Char(values) => out.extend_from_slice(values),
            ParameterValue::Int32(values) => {
                for &v in values {
                    out.write_i32::<LittleEndian>(v).map_err(io)?;
                }
            }
            ParameterValue::Float32(values) => {
                for &v in values {
                    out.write_f32::<LittleEndian>(v).map_err(io)?;
                }
            }
            ParameterValue::Float64(values) => {
                for &v in values {
                    out.write_f64::<LittleEndian>(v).map_err(io)?;
                }
            }
            ParameterValue::Int64(values) => {
                for &v in values {
                    out.write_i64::<LittleEndian>(v).map_err(io)?;
                }
            }
        }
    }
    Ok(out)
}

/// Decodes a header file into `(key, value)` pairs in storage order.
///
/// # Errors
///
/// - [`FormatError::BadMagic`] if the bytes are not a header file
/// - [`FormatError::Truncated`] if the file ends inside a parameter
/// - [`FormatError::Corrupted`] for unknown type tags, invalid UTF-8, or
///   trailing bytes
pub fn decode_header(path: &str, data: &[u8]) -> Result<Vec<(Key, ParameterValue)>> {
    let mut reader = ByteReader::new(path, data, 0);
    reader.read_magic(HEADER_MAGIC)?;
    reader.read_version()?;
    let count = reader.read_u32()? as usize;

    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let name_len = usize::from(reader.read_u16()?);
        let bytes = reader.take(name_len)?;
        let name = utf8(&reader, bytes)?;
        let tag = reader.read_u8()?;
        let kind = ParameterType::from_tag(tag).ok_or_else(|| {
            reader.corrupted(format!("parameter '{name}' has unknown type tag {tag}"))
        })?;
        let len = reader.read_u32()? as usize;

        let value = match kind {
            ParameterType::String => {
                let mut values = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    let n = usize::from(reader.read_u16()?);
                    let bytes = reader.take(n)?;
                    values.push(utf8(&reader, bytes)?);
                }
                ParameterValue::String(values)
            }
            ParameterType::Char => ParameterValue::Char(reader.take(len)?.to_vec()),
            ParameterType::Int32 => {
                let bytes = reader.take(len.saturating_mul(4))?;
                let mut values = vec![0; len];
                LittleEndian::read_i32_into(bytes, &mut values);
                ParameterValue::Int32(values)
            }
            ParameterType::Float32 => {
                let bytes = reader.take(len.saturating_mul(4))?;
                let mut values = vec![0.0; len];
                LittleEndian::read_f32_into(bytes, &mut values);
                ParameterValue::Float32(values)
            }
            ParameterType::Float64 => {
                let bytes = reader.take(len.saturating_mul(8))?;
                let mut values = vec![0.0; len];
                LittleEndian::read_f64_into(bytes, &mut values);
                ParameterValue::Float64(values)
            }
            ParameterType::Int64 => {
                let bytes = reader.take(len.saturating_mul(8))?;
                let mut values = vec![0; len];
                LittleEndian::read_i64_into(bytes, &mut values);
                ParameterValue::Int64(values)
            }
        };
        entries.push((Key::new(name, kind, len), value));
    }

    if reader.position() != data.len() {
        return Err(reader.corrupted(format!(
            "{} trailing bytes after {count} parameters",
            data.len() - reader.position()
        )));
    }
    Ok(entries)
}

fn utf8(reader: &ByteReader<'_>, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| reader.corrupted("invalid UTF-8 string".to_string()))
}

fn length_u32(path: &str, what: &str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        FormatError::Corrupted {
            path: path.to_string(),
            reason: format!("{what} has {len} entries"),
        }
        .into()
    })
}

/// Fixed header of a particle file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleFileHeader {
    /// First SFC index stored in the file.
    pub first_sfc: i64,
    /// Number of consecutive root cells stored in the file.
    pub num_cells: i64,
}

impl ParticleFileHeader {
    /// Appends the fixed header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&PARTICLE_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.first_sfc.to_le_bytes());
        out.extend_from_slice(&self.num_cells.to_le_bytes());
    }

    /// Decodes and checks the fixed header, including that the offset table
    /// fits in the file.
    ///
    /// # Errors
    ///
    /// Returns a format error if the header is malformed.
    pub fn decode(path: &str, data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(path, data, 0);
        reader.read_magic(PARTICLE_MAGIC)?;
        reader.read_version()?;
        let first_sfc = reader.read_i64()?;
        let num_cells = reader.read_i64()?;
        let table = u64::try_from(num_cells)
            .ok()
            .and_then(|n| n.checked_mul(8))
            .ok_or_else(|| reader.corrupted(format!("{num_cells} root cells")))?;
        reader.skip(table)?;
        Ok(Self {
            first_sfc,
            num_cells,
        })
    }
}

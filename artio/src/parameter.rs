//! Typed parameter dictionary for fileset headers.
//!
//! Every fileset carries a header of named, typed, array-valued parameters.
//! The set of names is not fixed across dataset versions, so callers discover
//! parameters in three steps:
//!
//! 1. find a name ([`ParameterStore::has_key`] or [`ParameterStore::iter`])
//! 2. describe it ([`ParameterStore::describe`]) to learn its type and length
//! 3. fetch its values with the accessor matching the type
//!
//! ```rust
//! use artio::parameter::{ParameterStore, ParameterType, ParameterValue};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ParameterStore::from_entries([
//!     ("num_root_cells".to_string(), ParameterValue::Int64(vec![512])),
//!     ("auni".to_string(), ParameterValue::Float64(vec![0.5])),
//! ])?;
//!
//! let key = store.describe("auni")?;
//! assert_eq!(key.kind, ParameterType::Float64);
//! assert_eq!(store.get_float64(&key)?, vec![0.5]);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use indexmap::IndexMap;
use indexmap::map::Entry;
use serde::{Deserialize, Serialize};

use crate::engine::StorageEngine;
use crate::error::{ParameterError, Result};

/// Maximum length of a single string parameter value, in bytes.
pub const MAX_STRING_LENGTH: usize = 256;

/// Declared element type of a parameter.
///
/// The discriminants are the type tags used by the on-disk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// UTF-8 strings.
    String = 0,
    /// Raw bytes.
    Char = 1,
    /// 32-bit signed integers.
    Int32 = 2,
    /// 32-bit floats.
    Float32 = 3,
    /// 64-bit floats.
    Float64 = 4,
    /// 64-bit signed integers.
    Int64 = 5,
}

impl ParameterType {
    /// Returns the on-disk tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parses an on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::String),
            1 => Some(Self::Char),
            2 => Some(Self::Int32),
            3 => Some(Self::Float32),
            4 => Some(Self::Float64),
            5 => Some(Self::Int64),
            _ => None,
        }
    }

    /// Returns the lowercase name of this type.
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Char => "char",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int64 => "int64",
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The values of one parameter, tagged with their element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum ParameterValue {
    /// String array.
    String(Vec<String>),
    /// Byte array.
    Char(Vec<u8>),
    /// 32-bit integer array.
    Int32(Vec<i32>),
    /// 32-bit float array.
    Float32(Vec<f32>),
    /// 64-bit float array.
    Float64(Vec<f64>),
    /// 64-bit integer array.
    Int64(Vec<i64>),
}

impl ParameterValue {
    /// Returns the element type of these values.
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            Self::String(_) => ParameterType::String,
            Self::Char(_) => ParameterType::Char,
            Self::Int32(_) => ParameterType::Int32,
            Self::Float32(_) => ParameterType::Float32,
            Self::Float64(_) => ParameterType::Float64,
            Self::Int64(_) => ParameterType::Int64,
        }
    }

    /// Returns the array length.
    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Int64(v) => v.len(),
        }
    }

    /// Returns `true` if the array holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::String(vec![value.to_string()])
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(values: Vec<String>) -> Self {
        Self::String(values)
    }
}

impl From<Vec<i32>> for ParameterValue {
    fn from(values: Vec<i32>) -> Self {
        Self::Int32(values)
    }
}

impl From<Vec<f32>> for ParameterValue {
    fn from(values: Vec<f32>) -> Self {
        Self::Float32(values)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Float64(values)
    }
}

impl From<Vec<i64>> for ParameterValue {
    fn from(values: Vec<i64>) -> Self {
        Self::Int64(values)
    }
}

/// Metadata describing one parameter: its name, type and array length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Parameter name, unique within a fileset.
    pub name: String,
    /// Declared element type.
    #[serde(rename = "type")]
    pub kind: ParameterType,
    /// Declared array length.
    pub length: usize,
}

impl Key {
    /// Creates a key.
    pub fn new(name: impl Into<String>, kind: ParameterType, length: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            length,
        }
    }
}

/// Ordered dictionary of a fileset's header parameters.
///
/// Entries keep the storage engine's native order, which is what
/// [`iter`](Self::iter) yields. The store is a snapshot: it is filled once when
/// the fileset opens and never changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    entries: IndexMap<String, ParameterValue>,
}

impl ParameterStore {
    /// Builds a store from `(name, value)` pairs in order.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::Corrupted`] if a name appears twice or a
    /// string value exceeds [`MAX_STRING_LENGTH`].
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, ParameterValue)>,
    {
        let mut store = Self::default();
        for (name, value) in entries {
            store.insert(name, value)?;
        }
        Ok(store)
    }

    /// Reads every parameter from a storage engine.
    ///
    /// Each value the engine returns must agree with the key it enumerated.
    pub(crate) fn load<E: StorageEngine>(engine: &E) -> Result<Self> {
        let mut store = Self::default();
        for key in engine.parameter_keys()? {
            let value = engine.read_parameter(&key)?;
            if value.parameter_type() != key.kind || value.len() != key.length {
                return Err(ParameterError::Corrupted {
                    reason: format!(
                        "declared {}[{}], engine returned {}[{}]",
                        key.kind,
                        key.length,
                        value.parameter_type(),
                        value.len()
                    ),
                    name: key.name,
                }
                .into());
            }
            store.insert(key.name, value)?;
        }
        tracing::debug!(parameters = store.len(), "loaded header parameters");
        Ok(store)
    }

    fn insert(&mut self, name: String, value: ParameterValue) -> Result<()> {
        if let ParameterValue::String(values) = &value
            && let Some(long) = values.iter().find(|s| s.len() > MAX_STRING_LENGTH)
        {
            return Err(ParameterError::Corrupted {
                reason: format!(
                    "string of {} bytes exceeds the {MAX_STRING_LENGTH} byte limit",
                    long.len()
                ),
                name,
            }
            .into());
        }

        match self.entries.entry(name) {
            Entry::Occupied(entry) => Err(ParameterError::Corrupted {
                name: entry.key().clone(),
                reason: "duplicate parameter name".to_string(),
            }
            .into()),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Returns the number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if a parameter with this name exists.
    pub fn has_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Describes the parameter with this name.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::NotFound`] if the name is absent.
    pub fn describe(&self, name: &str) -> Result<Key> {
        let value = self.entries.get(name).ok_or_else(|| ParameterError::NotFound {
            name: name.to_string(),
        })?;
        Ok(Key::new(name, value.parameter_type(), value.len()))
    }

    /// Iterates over parameter metadata in storage order.
    ///
    /// Each call starts again from the first parameter.
    pub fn iter(&self) -> Keys<'_> {
        Keys {
            inner: self.entries.iter(),
        }
    }

    /// Returns the raw tagged value of a parameter, if present.
    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name)
    }

    /// Finds the stored value for `key`, checking it against the accessor type.
    fn lookup(&self, key: &Key, requested: ParameterType) -> Result<&ParameterValue> {
        if key.kind != requested {
            return Err(ParameterError::TypeMismatch {
                name: key.name.clone(),
                requested,
                found: key.kind,
            }
            .into());
        }

        let value = self
            .entries
            .get(&key.name)
            .ok_or_else(|| ParameterError::NotFound {
                name: key.name.clone(),
            })?;

        if value.parameter_type() != key.kind || value.len() != key.length {
            return Err(ParameterError::Corrupted {
                name: key.name.clone(),
                reason: format!(
                    "key declares {}[{}], store holds {}[{}]",
                    key.kind,
                    key.length,
                    value.parameter_type(),
                    value.len()
                ),
            }
            .into());
        }

        Ok(value)
    }

    /// Returns the values of a string parameter.
    ///
    /// # Errors
    ///
    /// - [`ParameterError::TypeMismatch`] if `key` is not a string parameter
    /// - [`ParameterError::NotFound`] if the name is absent
    /// - [`ParameterError::Corrupted`] if the stored array disagrees with `key`
    pub fn get_string(&self, key: &Key) -> Result<Vec<String>> {
        match self.lookup(key, ParameterType::String)? {
            ParameterValue::String(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns the values of a char parameter.
    ///
    /// # Errors
    ///
    /// Same as [`get_string`](Self::get_string).
    pub fn get_char(&self, key: &Key) -> Result<Vec<u8>> {
        match self.lookup(key, ParameterType::Char)? {
            ParameterValue::Char(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns the values of an int32 parameter.
    ///
    /// # Errors
    ///
    /// Same as [`get_string`](Self::get_string).
    pub fn get_int32(&self, key: &Key) -> Result<Vec<i32>> {
        match self.lookup(key, ParameterType::Int32)? {
            ParameterValue::Int32(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns the values of a float32 parameter.
    ///
    /// # Errors
    ///
    /// Same as [`get_string`](Self::get_string).
    pub fn get_float32(&self, key: &Key) -> Result<Vec<f32>> {
        match self.lookup(key, ParameterType::Float32)? {
            ParameterValue::Float32(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns the values of a float64 parameter.
    ///
    /// # Errors
    ///
    /// Same as [`get_string`](Self::get_string).
    pub fn get_float64(&self, key: &Key) -> Result<Vec<f64>> {
        match self.lookup(key, ParameterType::Float64)? {
            ParameterValue::Float64(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns the values of an int64 parameter.
    ///
    /// # Errors
    ///
    /// Same as [`get_string`](Self::get_string).
    pub fn get_int64(&self, key: &Key) -> Result<Vec<i64>> {
        match self.lookup(key, ParameterType::Int64)? {
            ParameterValue::Int64(values) => Ok(values.clone()),
            _ => unreachable!("lookup checked the value tag"),
        }
    }

    /// Returns an integer parameter widened to `i64`, whether it was stored
    /// as int32 or int64.
    ///
    /// # Errors
    ///
    /// Returns [`ParameterError::NotFound`] if the name is absent, or
    /// [`ParameterError::TypeMismatch`] if it is not an integer parameter.
    pub fn get_integers(&self, name: &str) -> Result<Vec<i64>> {
        let key = self.describe(name)?;
        match key.kind {
            ParameterType::Int32 => Ok(self
                .get_int32(&key)?
                .into_iter()
                .map(i64::from)
                .collect()),
            _ => self.get_int64(&key),
        }
    }

    /// Returns the single value of a one-element int32 parameter.
    ///
    /// # Errors
    ///
    /// As [`get_int32`](Self::get_int32), plus
    /// [`ParameterError::LengthMismatch`] if the array length is not 1.
    pub fn get_scalar_int32(&self, name: &str) -> Result<i32> {
        let key = self.describe(name)?;
        scalar(&key, self.get_int32(&key)?)
    }

    /// Returns the single value of a one-element int64 parameter.
    ///
    /// # Errors
    ///
    /// As [`get_int64`](Self::get_int64), plus
    /// [`ParameterError::LengthMismatch`] if the array length is not 1.
    pub fn get_scalar_int64(&self, name: &str) -> Result<i64> {
        let key = self.describe(name)?;
        scalar(&key, self.get_int64(&key)?)
    }

    /// Returns the single value of a one-element float64 parameter.
    ///
    /// # Errors
    ///
    /// As [`get_float64`](Self::get_float64), plus
    /// [`ParameterError::LengthMismatch`] if the array length is not 1.
    pub fn get_scalar_float64(&self, name: &str) -> Result<f64> {
        let key = self.describe(name)?;
        scalar(&key, self.get_float64(&key)?)
    }
}

fn scalar<T: Copy>(key: &Key, values: Vec<T>) -> Result<T> {
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(ParameterError::LengthMismatch {
            name: key.name.clone(),
            expected: 1,
            found: values.len(),
        }
        .into()),
    }
}

/// Iterator over parameter metadata, created by [`ParameterStore::iter`].
#[derive(Debug, Clone)]
pub struct Keys<'a> {
    inner: indexmap::map::Iter<'a, String, ParameterValue>,
}

impl Iterator for Keys<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(name, value)| Key::new(name.as_str(), value.parameter_type(), value.len()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Keys<'_> {}

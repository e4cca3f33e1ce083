//! Core types for a shard
//!
//! This module defines the foundational types:
//! - SeriesId: Immutable byte identifier of a time series
//! - Tags: Immutable name/value pairs attached to a series
//! - TimeUnit: Precision hint carried with every datapoint
//! - Datapoint: A single (timestamp, value) sample

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::Timestamp;

/// Identifier of a time series
///
/// A SeriesId is an immutable byte sequence. Cloning is cheap (shared
/// allocation), which matters because the same id is held by the series
/// map, the entry itself and every fetch result that mentions it.
///
/// Ordering is byte-wise; the series map relies on it to give every
/// traversal a stable order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(Arc<[u8]>);

impl SeriesId {
    /// Create a SeriesId from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    /// Get the raw bytes of this SeriesId
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the id in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the id is zero-length (never valid for a write)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SeriesId {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<String> for SeriesId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for SeriesId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesId({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// A single tag (name/value pair)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name
    pub name: String,
    /// Tag value
    pub value: String,
}

/// Immutable set of tags attached to a series
///
/// Tags are fixed when a series entry is created and never change
/// afterwards. Like [`SeriesId`], clones share one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Tags(Arc<[Tag]>);

impl Tags {
    /// Empty tag set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a tag set from name/value pairs
    pub fn new<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let tags: Vec<Tag> = pairs
            .into_iter()
            .map(|(name, value)| Tag {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        Self(Arc::from(tags))
    }

    /// Look up a tag value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }

    /// Iterate over the tags in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tag set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Precision of a datapoint's timestamp as reported by the writer
///
/// The unit is carried through storage untouched; timestamps themselves
/// are always microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// Second precision
    #[default]
    Second,
    /// Millisecond precision
    Millisecond,
    /// Microsecond precision
    Microsecond,
    /// Nanosecond precision
    Nanosecond,
}

impl TimeUnit {
    /// Stable one-byte code used by the block encoding
    pub fn code(&self) -> u8 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Millisecond => 2,
            TimeUnit::Microsecond => 3,
            TimeUnit::Nanosecond => 4,
        }
    }

    /// Inverse of [`TimeUnit::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TimeUnit::Second),
            2 => Some(TimeUnit::Millisecond),
            3 => Some(TimeUnit::Microsecond),
            4 => Some(TimeUnit::Nanosecond),
            _ => None,
        }
    }
}

/// A single sample of a time series
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    /// When the sample was taken
    pub timestamp: Timestamp,
    /// Sample value (always finite once stored)
    pub value: f64,
    /// Precision reported by the writer
    pub unit: TimeUnit,
    /// Opaque per-point annotation
    pub annotation: Option<Arc<[u8]>>,
}

impl Datapoint {
    /// Create a datapoint without annotation
    pub fn new(timestamp: Timestamp, value: f64, unit: TimeUnit) -> Self {
        Self {
            timestamp,
            value,
            unit,
            annotation: None,
        }
    }

    /// Whether two points carry the same payload.
    ///
    /// Values are compared bit-for-bit so that the comparison is exact.
    pub fn same_payload(&self, other: &Datapoint) -> bool {
        self.value.to_bits() == other.value.to_bits()
            && self.unit == other.unit
            && self.annotation == other.annotation
    }
}

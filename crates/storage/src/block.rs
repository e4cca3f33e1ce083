//! Time blocks of a series
//!
//! A series keeps its data in blocks aligned to the configured block size.
//! Each block covers `[start, start + block_size)` and is in one of two
//! states:
//!
//! - [`OpenBlock`]: mutable, accepts writes, points kept decoded
//! - [`SealedBlock`]: immutable encoded bytes plus checksum, waiting for
//!   flush and later expiry
//!
//! # Encoding
//!
//! Sealed blocks store their points as little-endian records, ascending by
//! timestamp:
//!
//! ```text
//! | ts: u64 | value bits: u64 | unit: u8 | annotation len: u32 | annotation |
//! ```
//!
//! The CRC32 of the record bytes is kept next to them and verified on
//! every decode.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use chronoshard_core::{Datapoint, Result, ShardError, TimeUnit, Timestamp};

/// Fixed bytes per encoded point, excluding the annotation payload
const RECORD_HEADER_SIZE: usize = 8 + 8 + 1 + 4;

/// Encode points (ascending by timestamp) into block bytes.
pub fn encode_points<'a>(points: impl IntoIterator<Item = &'a Datapoint>) -> Vec<u8> {
    let mut buf = Vec::new();
    for point in points {
        let annotation = point.annotation.as_deref().unwrap_or(&[]);
        buf.reserve(RECORD_HEADER_SIZE + annotation.len());
        buf.extend_from_slice(&point.timestamp.as_micros().to_le_bytes());
        buf.extend_from_slice(&point.value.to_bits().to_le_bytes());
        buf.push(point.unit.code());
        buf.extend_from_slice(&(annotation.len() as u32).to_le_bytes());
        buf.extend_from_slice(annotation);
    }
    buf
}

/// Decode block bytes produced by [`encode_points`].
pub fn decode_points(data: &[u8]) -> Result<Vec<Datapoint>> {
    let mut cursor = Cursor::new(data);
    let mut points = Vec::new();
    while (cursor.position() as usize) < data.len() {
        points.push(decode_record(&mut cursor)?);
    }
    Ok(points)
}

fn decode_record(cursor: &mut Cursor<&[u8]>) -> Result<Datapoint> {
    let truncated = |_| ShardError::corruption("truncated block record");

    let timestamp = Timestamp::from_micros(cursor.read_u64::<LittleEndian>().map_err(truncated)?);
    let value = f64::from_bits(cursor.read_u64::<LittleEndian>().map_err(truncated)?);
    let code = cursor.read_u8().map_err(truncated)?;
    let unit = TimeUnit::from_code(code)
        .ok_or_else(|| ShardError::corruption(format!("unknown time unit code {}", code)))?;
    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let annotation = if len == 0 {
        None
    } else {
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(truncated)?;
        Some(Arc::from(bytes))
    };

    Ok(Datapoint {
        timestamp,
        value,
        unit,
        annotation,
    })
}

// ============================================================================
// Open blocks
// ============================================================================

/// Result of inserting a point into an open block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointInsert {
    /// No point existed at this timestamp
    Inserted,
    /// A point with a different payload was replaced
    Replaced,
    /// An identical point was already present
    Unchanged,
    /// A point with a different payload exists and was kept
    Conflict,
}

/// A block still accepting writes
#[derive(Debug, Clone)]
pub struct OpenBlock {
    start: Timestamp,
    points: BTreeMap<Timestamp, Datapoint>,
}

impl OpenBlock {
    /// Create an empty open block starting at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            points: BTreeMap::new(),
        }
    }

    /// Create an open block from already decoded points
    pub fn from_points(start: Timestamp, points: Vec<Datapoint>) -> Self {
        let points = points.into_iter().map(|p| (p.timestamp, p)).collect();
        Self { start, points }
    }

    /// Block start
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Insert a point, resolving an existing point at the same timestamp.
    ///
    /// With `overwrite` a differing payload replaces the stored one,
    /// otherwise the stored point is kept and `Conflict` is reported.
    pub fn insert(&mut self, point: Datapoint, overwrite: bool) -> PointInsert {
        match self.points.get_mut(&point.timestamp) {
            None => {
                self.points.insert(point.timestamp, point);
                PointInsert::Inserted
            }
            Some(existing) if existing.same_payload(&point) => PointInsert::Unchanged,
            Some(existing) if overwrite => {
                *existing = point;
                PointInsert::Replaced
            }
            Some(_) => PointInsert::Conflict,
        }
    }

    /// Add a point only if the timestamp is free. Returns whether it was added.
    pub fn fill(&mut self, point: Datapoint) -> bool {
        if self.points.contains_key(&point.timestamp) {
            return false;
        }
        self.points.insert(point.timestamp, point);
        true
    }

    /// Point stored at exactly `timestamp`
    pub fn get(&self, timestamp: Timestamp) -> Option<&Datapoint> {
        self.points.get(&timestamp)
    }

    /// Points in `[start, end)`
    pub fn range(&self, start: Timestamp, end: Timestamp) -> impl Iterator<Item = &Datapoint> {
        self.points.range(start..end).map(|(_, p)| p)
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the block holds no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Encode the current contents without sealing.
    pub fn encode(&self) -> Vec<u8> {
        encode_points(self.points.values())
    }

    /// Seal the block, freezing its contents.
    pub fn seal(self) -> SealedBlock {
        let points: Vec<Datapoint> = self.points.into_values().collect();
        SealedBlock::encode(self.start, &points)
    }
}

// ============================================================================
// Sealed blocks
// ============================================================================

/// Whether a sealed block has been handed to the flush collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Not yet accepted by the flush collaborator
    Pending,
    /// Persisted; safe to drop on expiry
    Flushed,
}

/// An immutable, time-bounded chunk of encoded series data
///
/// The encoded bytes are shared; cloning a sealed block never copies data
/// and never changes it.
#[derive(Debug, Clone)]
pub struct SealedBlock {
    start: Timestamp,
    data: Arc<[u8]>,
    checksum: u32,
    num_points: usize,
    flush_state: FlushState,
}

impl SealedBlock {
    /// Seal a set of points (ascending by timestamp) into a new block.
    ///
    /// The block starts out `Pending` flush.
    pub fn encode(start: Timestamp, points: &[Datapoint]) -> Self {
        let data = encode_points(points);
        let checksum = crc32fast::hash(&data);
        Self {
            start,
            data: Arc::from(data),
            checksum,
            num_points: points.len(),
            flush_state: FlushState::Pending,
        }
    }

    /// Rebuild a block from bytes loaded elsewhere (disk, peers).
    ///
    /// The checksum is verified and the bytes decoded once to validate them.
    /// Such blocks are already persisted and start out `Flushed`.
    pub fn from_encoded(start: Timestamp, data: Vec<u8>, checksum: u32) -> Result<Self> {
        let actual = crc32fast::hash(&data);
        if actual != checksum {
            return Err(ShardError::corruption(format!(
                "block {} checksum mismatch: expected {:08x}, got {:08x}",
                start, checksum, actual
            )));
        }
        let num_points = decode_points(&data)?.len();
        Ok(Self {
            start,
            data: Arc::from(data),
            checksum,
            num_points,
            flush_state: FlushState::Flushed,
        })
    }

    /// Block start
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Encoded bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// CRC32 of the encoded bytes
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of encoded points
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Flush state
    pub fn flush_state(&self) -> FlushState {
        self.flush_state
    }

    /// Whether the block has been persisted
    pub fn is_flushed(&self) -> bool {
        self.flush_state == FlushState::Flushed
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.flush_state = FlushState::Flushed;
    }

    /// Whether `other` shares this block's encoded bytes.
    pub(crate) fn same_data(&self, other: &SealedBlock) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Verify the checksum and decode the points.
    pub fn decode(&self) -> Result<Vec<Datapoint>> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.checksum {
            return Err(ShardError::corruption(format!(
                "block {} checksum mismatch: expected {:08x}, got {:08x}",
                self.start, self.checksum, actual
            )));
        }
        decode_points(&self.data)
    }
}

/// Metadata about one block, as returned by metadata fetches
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMetadata {
    /// Block start
    pub start: Timestamp,
    /// Encoded size, when requested
    pub size: Option<u64>,
    /// CRC32 of the encoded bytes, when requested
    pub checksum: Option<u32>,
    /// Last time the owning series was read, when requested
    pub last_read: Option<Timestamp>,
    /// Whether the block is sealed
    pub sealed: bool,
}

/// Which optional fields a metadata fetch fills in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchBlocksMetadataOptions {
    /// Fill [`BlockMetadata::size`]
    pub include_sizes: bool,
    /// Fill [`BlockMetadata::checksum`]
    pub include_checksums: bool,
    /// Fill [`BlockMetadata::last_read`]
    pub include_last_read: bool,
}

impl FetchBlocksMetadataOptions {
    /// Every optional field
    pub fn all() -> Self {
        Self {
            include_sizes: true,
            include_checksums: true,
            include_last_read: true,
        }
    }
}

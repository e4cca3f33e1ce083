//! Paged block metadata fetch
//!
//! Walks the series map with the same weak-snapshot traversal tick uses and
//! reports, per series, the blocks intersecting a time range. A page ends
//! after `limit` series; its token resumes the traversal right after the
//! last series returned.
//!
//! # Page token format
//!
//! ```text
//! | version: u8 | bucket: u32 | has_after: u8 | id len: u32 | id bytes |
//! ```
//!
//! All integers little-endian.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use chronoshard_core::{Result, SeriesId, ShardError, Tags, Timestamp};

use super::Shard;
use crate::block::{BlockMetadata, FetchBlocksMetadataOptions};
use crate::cancel::Cancellable;
use crate::map::MapCursor;

const PAGE_TOKEN_VERSION: u8 = 1;

/// Entries visited between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 64;

/// Opaque continuation of a metadata fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(Vec<u8>);

impl PageToken {
    /// Token from bytes previously returned by [`as_bytes`](Self::as_bytes)
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        PageToken(bytes.into())
    }

    /// Token bytes, for handing to a remote caller
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn encode(cursor: &MapCursor) -> Self {
        let mut buf = Vec::with_capacity(10);
        buf.push(PAGE_TOKEN_VERSION);
        buf.extend_from_slice(&(cursor.bucket() as u32).to_le_bytes());
        match cursor.after() {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
                buf.extend_from_slice(id.as_bytes());
            }
            None => buf.push(0),
        }
        PageToken(buf)
    }

    fn decode(&self, num_buckets: usize) -> Result<MapCursor> {
        let malformed = |_| ShardError::invalid_input("malformed page token");
        let mut cursor = Cursor::new(self.0.as_slice());

        let version = cursor.read_u8().map_err(malformed)?;
        if version != PAGE_TOKEN_VERSION {
            return Err(ShardError::invalid_input(format!(
                "unsupported page token version {}",
                version
            )));
        }
        let bucket = cursor.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        if bucket >= num_buckets {
            return Err(ShardError::invalid_input(format!(
                "page token bucket {} out of range",
                bucket
            )));
        }
        let after = match cursor.read_u8().map_err(malformed)? {
            0 => None,
            1 => {
                let len = cursor.read_u32::<LittleEndian>().map_err(malformed)? as usize;
                let mut id = vec![0u8; len];
                cursor.read_exact(&mut id).map_err(malformed)?;
                Some(SeriesId::from(id))
            }
            _ => return Err(ShardError::invalid_input("malformed page token")),
        };
        if (cursor.position() as usize) != self.0.len() {
            return Err(ShardError::invalid_input("malformed page token"));
        }
        Ok(MapCursor::new(bucket, after))
    }
}

/// Blocks of one series intersecting the fetched range
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBlocksMetadata {
    /// Series id
    pub id: SeriesId,
    /// Series tags
    pub tags: Tags,
    /// Intersecting blocks, ascending by start
    pub blocks: Vec<BlockMetadata>,
}

/// One page of a metadata fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBlocksMetadataPage {
    /// Series with at least one intersecting block
    pub series: Vec<SeriesBlocksMetadata>,
    /// Token for the next page, `None` once the walk is complete
    pub next_page_token: Option<PageToken>,
}

impl Shard {
    /// Fetch metadata of blocks intersecting `[start, end)`, at most
    /// `limit` series per page.
    ///
    /// Pass the previous page's token to continue. Series returned count
    /// as read for eviction purposes.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty range, a zero limit or a bad token
    /// - `NotBootstrapped` before bootstrap completes
    /// - `ShardClosed` once closing
    /// - `Cancelled` if `cancel` fires during the walk
    pub fn fetch_blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
        limit: usize,
        page_token: Option<&PageToken>,
        options: FetchBlocksMetadataOptions,
        cancel: &dyn Cancellable,
    ) -> Result<FetchBlocksMetadataPage> {
        self.check_readable()?;
        if start >= end {
            return Err(ShardError::invalid_input(format!(
                "fetch range start {} must be before end {}",
                start, end
            )));
        }
        if limit == 0 {
            return Err(ShardError::invalid_input("fetch limit must be greater than zero"));
        }
        let cursor = match page_token {
            Some(token) => token.decode(self.series.num_buckets())?,
            None => MapCursor::default(),
        };
        if cancel.is_cancelled() {
            return Err(ShardError::Cancelled);
        }

        let block_size = self.config.block_size();
        let now = self.clock.now();
        let mut series = Vec::new();
        let mut entries = self.series.iter_from(cursor);
        let mut visited = 0usize;

        while let Some(entry) = entries.next() {
            visited += 1;
            if visited % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(ShardError::Cancelled);
            }

            let blocks = entry.blocks_metadata(start, end, block_size, &options);
            if blocks.is_empty() {
                continue;
            }
            entry.touch_read(now);
            series.push(SeriesBlocksMetadata {
                id: entry.id().clone(),
                tags: entry.tags().clone(),
                blocks,
            });

            if series.len() == limit {
                return Ok(FetchBlocksMetadataPage {
                    series,
                    next_page_token: Some(PageToken::encode(&entries.cursor())),
                });
            }
        }

        Ok(FetchBlocksMetadataPage {
            series,
            next_page_token: None,
        })
    }
}

//! Concurrent series map
//!
//! Maps series ids to their [`SeriesEntry`]. Lock striping keeps writers of
//! different series from contending, and iteration never holds a lock for
//! longer than it takes to copy one stripe's entry handles.
//!
//! # Design
//!
//! - N stripes, each an `RwLock<FxHashMap>`; an id's stripe is its FxHash
//!   modulo N
//! - Entries are shared as `Arc<SeriesEntry>`; identity (`Arc::ptr_eq`),
//!   not the id, decides whether a compare-and-remove succeeds
//! - Iteration walks stripes in order and each stripe's entries sorted by
//!   id, so one traversal has a stable order and can be resumed from a
//!   [`MapCursor`]
//!
//! # Consistency
//!
//! Iteration is a weak snapshot: entries inserted or removed while a
//! traversal is under way may or may not be seen, but no entry is ever
//! yielded twice by one traversal and no entry is ever torn.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chronoshard_core::SeriesId;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::entry::SeriesEntry;

type Bucket = RwLock<FxHashMap<SeriesId, Arc<SeriesEntry>>>;

/// Concurrent map from series id to entry
pub struct SeriesMap {
    buckets: Box<[Bucket]>,
    next_index: AtomicU64,
}

impl SeriesMap {
    /// Create a map with `num_buckets` lock stripes (at least one)
    pub fn new(num_buckets: usize) -> Self {
        let buckets = (0..num_buckets.max(1))
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            next_index: AtomicU64::new(0),
        }
    }

    /// Number of lock stripes
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, id: &SeriesId) -> usize {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    /// Live entry for `id`, if any
    ///
    /// Only takes the stripe's read lock; never waits on tick or fetch.
    pub fn lookup(&self, id: &SeriesId) -> Option<Arc<SeriesEntry>> {
        self.buckets[self.bucket_of(id)]
            .read()
            .get(id)
            .filter(|entry| !entry.is_retired())
            .cloned()
    }

    /// Return the live entry for `id`, creating it with `factory` if absent.
    ///
    /// The factory receives a fresh shard-unique index and runs at most
    /// once, under the stripe's write lock, so concurrent callers for the
    /// same new id all observe the same winner. A retired entry still in the
    /// map counts as absent and is replaced.
    ///
    /// Returns the entry and whether this call created it.
    pub fn insert_if_absent<F>(&self, id: &SeriesId, factory: F) -> (Arc<SeriesEntry>, bool)
    where
        F: FnOnce(u64) -> SeriesEntry,
    {
        if let Some(entry) = self.lookup(id) {
            return (entry, false);
        }

        let mut bucket = self.buckets[self.bucket_of(id)].write();
        if let Some(existing) = bucket.get(id) {
            if !existing.is_retired() {
                return (Arc::clone(existing), false);
            }
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(factory(index));
        bucket.insert(id.clone(), Arc::clone(&entry));
        (entry, true)
    }

    /// Remove `id` only if it still maps to exactly `expected`.
    ///
    /// Returns whether the entry was removed.
    pub fn remove_if(&self, id: &SeriesId, expected: &Arc<SeriesEntry>) -> bool {
        let mut bucket = self.buckets[self.bucket_of(id)].write();
        match bucket.get(id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                bucket.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Number of entries (retired entries awaiting removal included)
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.read().is_empty())
    }

    /// Drop every entry, returning how many were held
    pub fn clear(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                let mut bucket = bucket.write();
                let len = bucket.len();
                bucket.clear();
                len
            })
            .sum()
    }

    /// Start a traversal from the beginning
    pub fn iter(&self) -> SeriesIter<'_> {
        self.iter_from(MapCursor::default())
    }

    /// Resume a traversal just after `cursor`
    pub fn iter_from(&self, cursor: MapCursor) -> SeriesIter<'_> {
        SeriesIter {
            map: self,
            next_bucket: cursor.bucket,
            resume_after: cursor.after.clone(),
            loaded_bucket: cursor.bucket,
            buffer: VecDeque::new(),
            position: cursor,
        }
    }
}

impl Default for SeriesMap {
    fn default() -> Self {
        Self::new(16)
    }
}

impl std::fmt::Debug for SeriesMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesMap")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .finish()
    }
}

/// Position in a traversal: the stripe and the last id yielded from it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapCursor {
    pub(crate) bucket: usize,
    pub(crate) after: Option<SeriesId>,
}

impl MapCursor {
    /// Cursor positioned just after `after` in stripe `bucket`
    pub fn new(bucket: usize, after: Option<SeriesId>) -> Self {
        Self { bucket, after }
    }

    /// Stripe index
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Last id yielded from the stripe, if any
    pub fn after(&self) -> Option<&SeriesId> {
        self.after.as_ref()
    }
}

/// Lazy traversal over a [`SeriesMap`]
///
/// Each stripe is copied (entry handles only) under its read lock when the
/// traversal reaches it; no lock is held between calls to `next`.
pub struct SeriesIter<'a> {
    map: &'a SeriesMap,
    next_bucket: usize,
    resume_after: Option<SeriesId>,
    loaded_bucket: usize,
    buffer: VecDeque<Arc<SeriesEntry>>,
    position: MapCursor,
}

impl<'a> SeriesIter<'a> {
    /// Up to `n` further entries
    pub fn next_batch(&mut self, n: usize) -> Vec<Arc<SeriesEntry>> {
        self.by_ref().take(n).collect()
    }

    /// Cursor just after the last yielded entry
    pub fn cursor(&self) -> MapCursor {
        self.position.clone()
    }

    fn load_next_bucket(&mut self) -> bool {
        if self.next_bucket >= self.map.buckets.len() {
            return false;
        }
        let after = self.resume_after.take();
        let mut entries: Vec<Arc<SeriesEntry>> = {
            let bucket = self.map.buckets[self.next_bucket].read();
            bucket
                .iter()
                .filter(|(id, _)| after.as_ref().map_or(true, |after| *id > after))
                .map(|(_, entry)| Arc::clone(entry))
                .collect()
        };
        entries.sort_unstable_by(|a, b| a.id().cmp(b.id()));

        self.buffer = entries.into();
        self.loaded_bucket = self.next_bucket;
        self.next_bucket += 1;
        true
    }
}

impl<'a> Iterator for SeriesIter<'a> {
    type Item = Arc<SeriesEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                if entry.is_retired() {
                    continue;
                }
                self.position = MapCursor::new(self.loaded_bucket, Some(entry.id().clone()));
                return Some(entry);
            }
            if !self.load_next_bucket() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronoshard_core::{Tags, Timestamp};
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn new_entry(id: &SeriesId) -> impl FnOnce(u64) -> SeriesEntry + '_ {
        move |index| SeriesEntry::new(id.clone(), Tags::empty(), index, Timestamp::now())
    }

    fn ids(n: usize) -> Vec<SeriesId> {
        (0..n).map(|i| SeriesId::from(format!("foo.{}", i))).collect()
    }

    #[test]
    fn test_insert_if_absent_invokes_factory_once() {
        let map = SeriesMap::new(4);
        let id = SeriesId::from("foo");

        let (first, created) = map.insert_if_absent(&id, new_entry(&id));
        assert!(created);
        let (second, created) = map.insert_if_absent(&id, |_| panic!("factory must not run"));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&map.lookup(&id).unwrap(), &first));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_concurrent_insert_if_absent_single_winner() {
        let map = Arc::new(SeriesMap::new(4));
        let id = SeriesId::from("contested");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let id = id.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.insert_if_absent(&id, new_entry(&id))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let winner = &results[0].0;
        assert!(results.iter().all(|(entry, _)| Arc::ptr_eq(entry, winner)));
    }

    #[test]
    fn test_remove_if_requires_identity() {
        let map = SeriesMap::new(4);
        let id = SeriesId::from("foo");
        let (entry, _) = map.insert_if_absent(&id, new_entry(&id));
        let impostor = Arc::new(SeriesEntry::new(id.clone(), Tags::empty(), 99, Timestamp::now()));

        assert!(!map.remove_if(&id, &impostor));
        assert!(map.lookup(&id).is_some());
        assert!(map.remove_if(&id, &entry));
        assert!(map.lookup(&id).is_none());
        assert!(!map.remove_if(&id, &entry));
    }

    #[test]
    fn test_unique_indexes_increase() {
        let map = SeriesMap::new(2);
        let indexes: Vec<u64> = ids(5)
            .iter()
            .map(|id| map.insert_if_absent(id, new_entry(id)).0.unique_index())
            .collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_iteration_visits_each_entry_once() {
        use rand::seq::SliceRandom;

        let map = SeriesMap::new(4);
        let mut shuffled = ids(50);
        shuffled.shuffle(&mut rand::thread_rng());
        for id in shuffled {
            map.insert_if_absent(&id, new_entry(&id));
        }

        let mut seen = HashSet::new();
        let mut iter = map.iter();
        loop {
            let batch = iter.next_batch(7);
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                assert!(seen.insert(entry.id().clone()), "duplicate {}", entry.id());
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn test_iteration_order_is_stable_and_resumable() {
        let map = SeriesMap::new(3);
        for id in ids(20) {
            map.insert_if_absent(&id, new_entry(&id));
        }

        let full: Vec<SeriesId> = map.iter().map(|e| e.id().clone()).collect();
        let again: Vec<SeriesId> = map.iter().map(|e| e.id().clone()).collect();
        assert_eq!(full, again);

        let mut iter = map.iter();
        let head: Vec<SeriesId> = iter.next_batch(8).iter().map(|e| e.id().clone()).collect();
        let cursor = iter.cursor();
        let tail: Vec<SeriesId> = map.iter_from(cursor).map(|e| e.id().clone()).collect();

        let mut joined = head;
        joined.extend(tail);
        assert_eq!(joined, full);
    }

    #[test]
    fn test_iteration_tolerates_concurrent_mutation() {
        let map = Arc::new(SeriesMap::new(4));
        for id in ids(100) {
            map.insert_if_absent(&id, new_entry(&id));
        }

        let writer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 100..200 {
                    let id = SeriesId::from(format!("foo.{}", i));
                    map.insert_if_absent(&id, new_entry(&id));
                }
                for id in ids(50) {
                    if let Some(entry) = map.lookup(&id) {
                        map.remove_if(&id, &entry);
                    }
                }
            })
        };

        let mut seen = HashSet::new();
        for entry in map.iter() {
            assert!(seen.insert(entry.id().clone()));
        }
        writer.join().unwrap();

        // Entries never touched by the writer are always seen.
        for id in (50..100).map(|i| SeriesId::from(format!("foo.{}", i))) {
            assert!(seen.contains(&id), "missing {}", id);
        }
    }

    #[test]
    fn test_clear() {
        let map = SeriesMap::new(4);
        for id in ids(10) {
            map.insert_if_absent(&id, new_entry(&id));
        }
        assert_eq!(map.clear(), 10);
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }
}

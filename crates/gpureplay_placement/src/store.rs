//! Append-only placement data log.

use crate::record::{HEADER_LEN, PlacementRecord, RECORD_LEN, decode_header, encode_header};
use bytes::BytesMut;
use gpureplay_core::{CoreError, CoreResult, ObjectKey, heap_aligned_offset};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Canonical placements of one heap, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapPlacements {
    records: IndexMap<ObjectKey, PlacementRecord>,
}

impl HeapPlacements {
    /// Record for `resource`
    #[must_use]
    pub fn get(&self, resource: ObjectKey) -> Option<&PlacementRecord> {
        self.records.get(&resource)
    }

    /// Insert or replace a record
    pub fn insert(&mut self, record: PlacementRecord) {
        self.records.insert(record.resource_key, record);
    }

    /// All records
    pub fn records(&self) -> impl Iterator<Item = &PlacementRecord> {
        self.records.values()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Heap size that holds every record, rounded up to `alignment`
    #[must_use]
    pub fn canonical_size(&self, alignment: u64) -> u64 {
        let end = self.records().map(PlacementRecord::end).max().unwrap_or(0);
        heap_aligned_offset(alignment, end)
    }
}

/// Decode a whole log image into per-heap placements
///
/// Later records for the same `(heap, resource)` replace earlier ones.
///
/// # Errors
///
/// Returns error on a bad header or a truncated record
pub fn decode_log(bytes: &[u8]) -> CoreResult<IndexMap<ObjectKey, HeapPlacements>> {
    let mut buf = bytes;
    decode_header(&mut buf)?;
    if buf.len() % RECORD_LEN != 0 {
        return Err(CoreError::PersistenceCorruption {
            reason: format!(
                "{} trailing bytes after {} records",
                buf.len() % RECORD_LEN,
                buf.len() / RECORD_LEN
            ),
        });
    }
    let mut heaps: IndexMap<ObjectKey, HeapPlacements> = IndexMap::new();
    while !buf.is_empty() {
        let record = PlacementRecord::decode(&mut buf)?;
        heaps.entry(record.heap_key).or_default().insert(record);
    }
    Ok(heaps)
}

/// Log statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    /// Records loaded at open
    pub loaded: usize,
    /// Records appended this run
    pub appended: usize,
    /// Records skipped because the same record was already persisted
    pub unchanged: usize,
    /// The file was discarded as corrupt at open
    pub discarded: bool,
}

/// The on-disk placement log and its in-memory image
#[derive(Debug)]
pub struct PlacementLog {
    path: PathBuf,
    heaps: IndexMap<ObjectKey, HeapPlacements>,
    /// Truncate and write a fresh header on the next append
    recreate: bool,
    stats: LogStats,
}

impl PlacementLog {
    /// Open the log at `path`
    ///
    /// A missing file yields an empty log. A corrupt file is discarded with a
    /// warning and recreated on the next append.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut log = Self {
            path,
            heaps: IndexMap::new(),
            recreate: false,
            stats: LogStats::default(),
        };
        match Self::load(&log.path) {
            Ok(Some(heaps)) => {
                log.stats.loaded = heaps.values().map(HeapPlacements::len).sum();
                info!(
                    path = %log.path.display(),
                    heaps = heaps.len(),
                    records = log.stats.loaded,
                    "loaded placement data"
                );
                log.heaps = heaps;
            }
            Ok(None) => {
                debug!(path = %log.path.display(), "no placement data, starting fresh");
            }
            Err(err) => {
                warn!(path = %log.path.display(), error = %err, "discarding placement data");
                log.recreate = true;
                log.stats.discarded = true;
            }
        }
        log
    }

    /// Read and decode the log at `path`, `None` when it does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is corrupt
    pub fn load(path: &Path) -> CoreResult<Option<IndexMap<ObjectKey, HeapPlacements>>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        decode_log(&bytes).map(Some)
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Placements for `heap`
    #[must_use]
    pub fn heap(&self, heap: ObjectKey) -> Option<&HeapPlacements> {
        self.heaps.get(&heap)
    }

    /// All heaps in first-seen order
    pub fn heaps(&self) -> impl Iterator<Item = (&ObjectKey, &HeapPlacements)> {
        self.heaps.iter()
    }

    /// Record for `(heap, resource)`
    #[must_use]
    pub fn record(&self, heap: ObjectKey, resource: ObjectKey) -> Option<&PlacementRecord> {
        self.heaps.get(&heap)?.get(resource)
    }

    /// Statistics
    #[must_use]
    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    /// Append records that differ from what is already persisted
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn append(&mut self, records: &[PlacementRecord]) -> CoreResult<usize> {
        let changed: Vec<&PlacementRecord> = records
            .iter()
            .filter(|r| self.record(r.heap_key, r.resource_key) != Some(*r))
            .collect();
        self.stats.unchanged += records.len() - changed.len();
        if changed.is_empty() {
            return Ok(0);
        }

        let fresh = self.recreate
            || std::fs::metadata(&self.path).map_or(true, |m| m.len() < HEADER_LEN as u64);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + changed.len() * RECORD_LEN);
        if fresh {
            encode_header(&mut buf);
        }
        for record in &changed {
            record.encode(&mut buf);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!fresh)
            .truncate(fresh)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.flush()?;
        self.recreate = false;

        for record in &changed {
            self.heaps
                .entry(record.heap_key)
                .or_default()
                .insert(**record);
        }
        self.stats.appended += changed.len();
        debug!(
            path = %self.path.display(),
            records = changed.len(),
            "appended placement data"
        );
        Ok(changed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpureplay_core::ResourceDesc;

    fn record(heap: u32, resource: u32, offset: u64) -> PlacementRecord {
        PlacementRecord {
            heap_key: ObjectKey::new(heap),
            resource_key: ObjectKey::new(resource),
            capture_offset: offset,
            current_offset: offset,
            size: 256,
            alignment: 64,
            description: ResourceDesc::buffer(256).snapshot(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = PlacementLog::open(dir.path().join("placement.dat"));
        assert_eq!(log.heaps().count(), 0);
        assert!(!log.stats().discarded);
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.dat");

        let mut log = PlacementLog::open(&path);
        assert_eq!(log.append(&[record(1, 10, 0), record(1, 11, 256)]).unwrap(), 2);
        assert_eq!(log.append(&[record(2, 20, 0)]).unwrap(), 1);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (HEADER_LEN + 3 * RECORD_LEN) as u64);

        let reloaded = PlacementLog::open(&path);
        assert_eq!(reloaded.stats().loaded, 3);
        let heaps: Vec<_> = reloaded.heaps().map(|(k, _)| k.as_u32()).collect();
        assert_eq!(heaps, vec![1, 2]);
        assert_eq!(
            reloaded.record(ObjectKey::new(1), ObjectKey::new(11)),
            Some(&record(1, 11, 256))
        );
    }

    #[test]
    fn test_unchanged_records_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.dat");
        PlacementLog::open(&path).append(&[record(1, 10, 0)]).unwrap();
        let before = std::fs::read(&path).unwrap();

        let mut log = PlacementLog::open(&path);
        assert_eq!(log.append(&[record(1, 10, 0)]).unwrap(), 0);
        assert_eq!(log.stats().unchanged, 1);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_later_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.dat");
        let mut log = PlacementLog::open(&path);
        log.append(&[record(1, 10, 0)]).unwrap();
        let mut moved = record(1, 10, 0);
        moved.current_offset = 512;
        log.append(&[moved]).unwrap();

        let reloaded = PlacementLog::open(&path);
        assert_eq!(reloaded.stats().loaded, 1);
        assert_eq!(
            reloaded
                .record(ObjectKey::new(1), ObjectKey::new(10))
                .map(|r| r.current_offset),
            Some(512)
        );
    }

    #[test]
    fn test_corrupt_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.dat");
        PlacementLog::open(&path)
            .append(&[record(1, 10, 0), record(1, 11, 256)])
            .unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 5);
        std::fs::write(&path, &bytes).unwrap();

        let mut log = PlacementLog::open(&path);
        assert!(log.stats().discarded);
        assert!(log.heap(ObjectKey::new(1)).is_none());

        log.append(&[record(3, 30, 0)]).unwrap();
        let reloaded = PlacementLog::open(&path);
        assert!(!reloaded.stats().discarded);
        assert_eq!(reloaded.stats().loaded, 1);
    }

    #[test]
    fn test_bad_magic_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placement.dat");
        std::fs::write(&path, b"not a placement log at all").unwrap();
        let log = PlacementLog::open(&path);
        assert!(log.stats().discarded);
    }

    #[test]
    fn test_canonical_size() {
        let mut heap = HeapPlacements::default();
        assert_eq!(heap.canonical_size(64), 0);
        heap.insert(record(1, 10, 0));
        let mut grown = record(1, 11, 256);
        grown.current_offset = 320;
        heap.insert(grown);
        assert_eq!(heap.canonical_size(64), 576);
        assert_eq!(heap.canonical_size(1024), 1024);
    }
}

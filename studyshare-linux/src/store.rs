//! On-disk chunk store: the single source of truth for which parts exist locally.
//!
//! Layout under the data dir:
//!   videos/<video dir>/part_<n>.mp4      committed parts
//!   videos/<video dir>/.part_<n>.<uuid>.tmp   download staging
//!   incoming/<transfer id>.incoming      peer-transfer staging
//!   orphaned/                            inbound files with no part identity
//!   index.json                           records, including their source
//!
//! Writers never touch final paths directly: they stage, then `record_chunk` does
//! check-then-rename under the store lock.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use studyshare_core::chunk::{parse_part_file_name, video_dir_name};
use studyshare_core::{AcquisitionSource, ChunkIdentity, ChunkRecord, ErrorKind, TransferId};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("index: {0}")]
    Index(#[from] serde_json::Error),
}

impl StoreError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<ChunkIdentity, ChunkRecord>,
}

pub struct ChunkStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl ChunkStore {
    /// Open (or create) a store at `root`. Records whose files vanished are pruned.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["videos", "incoming", "orphaned"] {
            let p = root.join(dir);
            std::fs::create_dir_all(&p).map_err(|e| StoreError::io("create", &p, e))?;
        }
        let store = Self {
            root,
            inner: Mutex::new(Inner::default()),
        };
        let loaded = store.load_index()?;
        let before = loaded.len();
        let records: BTreeMap<ChunkIdentity, ChunkRecord> = loaded
            .into_iter()
            .filter(|r| r.path.is_file())
            .map(|r| (r.identity.clone(), r))
            .collect();
        if records.len() != before {
            info!(pruned = before - records.len(), "dropped records whose files are gone");
        }
        {
            let mut inner = store.inner.lock();
            inner.records = records;
            store.persist(&inner)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn load_index(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        let path = self.index_path();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => Ok(records),
                Err(e) => {
                    warn!(error = %e, "index unreadable, starting empty");
                    Ok(Vec::new())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io("read", &path, e)),
        }
    }

    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let records: Vec<&ChunkRecord> = inner.records.values().collect();
        let json = serde_json::to_vec_pretty(&records)?;
        let path = self.index_path();
        let tmp = self.root.join(format!(".{}.tmp", INDEX_FILE));
        std::fs::write(&tmp, json).map_err(|e| StoreError::io("write", &tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io("rename", &path, e))
    }

    fn video_dir(&self, video_title: &str) -> PathBuf {
        self.root.join("videos").join(video_dir_name(video_title))
    }

    /// Final on-disk location of a part, whether or not it exists yet.
    pub fn part_path(&self, identity: &ChunkIdentity) -> PathBuf {
        self.video_dir(&identity.video_title)
            .join(identity.file_name())
    }

    /// True iff a record exists and its file is on disk.
    pub fn has_chunk(&self, identity: &ChunkIdentity) -> bool {
        self.get(identity).is_some()
    }

    /// The record for `identity`, if its file is still present.
    pub fn get(&self, identity: &ChunkIdentity) -> Option<ChunkRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .get(identity)
            .filter(|r| r.path.is_file())
            .cloned()
    }

    /// Fresh staging path for a download of `identity`, under the video's directory.
    pub fn staging_path(&self, identity: &ChunkIdentity) -> Result<PathBuf, StoreError> {
        let dir = self.video_dir(&identity.video_title);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io("create", &dir, e))?;
        Ok(dir.join(format!(
            ".part_{}.{}.tmp",
            identity.part_index,
            uuid::Uuid::new_v4().simple()
        )))
    }

    /// Staging path for an inbound peer payload.
    pub fn incoming_path(&self, transfer_id: TransferId) -> PathBuf {
        self.root
            .join("incoming")
            .join(format!("{}.incoming", transfer_id))
    }

    /// Remove a staged file. Missing files are fine.
    pub fn discard(&self, staged: &Path) {
        match std::fs::remove_file(staged) {
            Ok(()) => debug!(path = %staged.display(), "discarded staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staged.display(), error = %e, "could not remove staged file"),
        }
    }

    /// Record a completed part. Idempotent: if `identity` already has a record, that record is
    /// returned unchanged and `file_path` is discarded when it lives inside the store.
    /// Otherwise the file is moved to its final path and a new record is created.
    pub fn record_chunk(
        &self,
        identity: &ChunkIdentity,
        file_path: &Path,
        source: AcquisitionSource,
    ) -> Result<ChunkRecord, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get(identity).filter(|r| r.path.is_file()) {
            let existing = existing.clone();
            if file_path != existing.path && file_path.starts_with(&self.root) {
                self.discard(file_path);
            }
            debug!(video = %identity.video_title, part = identity.part_index, "already recorded");
            return Ok(existing);
        }

        let final_path = self.part_path(identity);
        if file_path != final_path {
            if let Some(dir) = final_path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::io("create", dir, e))?;
            }
            std::fs::rename(file_path, &final_path)
                .map_err(|e| StoreError::io("rename", file_path, e))?;
        }
        let size = std::fs::metadata(&final_path)
            .map_err(|e| StoreError::io("stat", &final_path, e))?
            .len();
        let record = ChunkRecord {
            identity: identity.clone(),
            path: final_path,
            size,
            source,
        };
        inner.records.insert(identity.clone(), record.clone());
        self.persist(&inner)?;
        info!(
            video = %identity.video_title,
            part = identity.part_index,
            size,
            source = ?source,
            "chunk recorded"
        );
        Ok(record)
    }

    /// Records of one video, ordered by part index.
    pub fn list_chunks(&self, video_title: &str) -> Vec<ChunkRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .range(ChunkIdentity::new(video_title, 0)..=ChunkIdentity::new(video_title, u32::MAX))
            .map(|(_, r)| r.clone())
            .filter(|r| r.path.is_file())
            .collect()
    }

    pub fn all_chunks(&self) -> Vec<ChunkRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .values()
            .filter(|r| r.path.is_file())
            .cloned()
            .collect()
    }

    /// Adopt `part_<n>.mp4` files already in the video's directory that have no record.
    /// Returns the newly adopted records.
    pub fn rescan(&self, video_title: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let dir = self.video_dir(video_title);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("read_dir", &dir, e)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("read_dir", &dir, e))?;
            let name = entry.file_name();
            let Some(part_index) = name.to_str().and_then(parse_part_file_name) else {
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| StoreError::io("stat", &entry.path(), e))?;
            if meta.is_file() {
                found.push((part_index, entry.path(), meta.len()));
            }
        }

        let mut inner = self.inner.lock();
        let mut adopted = Vec::new();
        for (part_index, path, size) in found {
            let identity = ChunkIdentity::new(video_title, part_index);
            if inner.records.get(&identity).map_or(false, |r| r.path.is_file()) {
                continue;
            }
            let record = ChunkRecord {
                identity: identity.clone(),
                path,
                size,
                source: AcquisitionSource::Downloaded,
            };
            inner.records.insert(identity, record.clone());
            adopted.push(record);
        }
        if !adopted.is_empty() {
            self.persist(&inner)?;
            info!(video = %video_title, adopted = adopted.len(), "adopted part files from disk");
        }
        adopted.sort_by_key(|r| r.identity.part_index);
        Ok(adopted)
    }

    /// Move an inbound file with no part identity into `orphaned/`. Returns its new path.
    pub fn adopt_orphan(&self, staged: &Path, file_name: &str) -> Result<PathBuf, StoreError> {
        let dir = self.root.join("orphaned");
        let base = video_dir_name(file_name);
        let mut dest = dir.join(&base);
        if dest.exists() {
            dest = dir.join(format!("{}.{}", uuid::Uuid::new_v4().simple(), base));
        }
        std::fs::rename(staged, &dest).map_err(|e| StoreError::io("rename", staged, e))?;
        warn!(path = %dest.display(), "kept inbound file with no part identity");
        Ok(dest)
    }

    pub fn orphans(&self) -> Vec<PathBuf> {
        let dir = self.root.join("orphaned");
        let mut out: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Remove one part's file and record. Returns whether a record existed.
    pub fn delete_chunk(&self, identity: &ChunkIdentity) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.remove(identity) else {
            return Ok(false);
        };
        remove_file_if_present(&record.path)?;
        self.persist(&inner)?;
        info!(video = %identity.video_title, part = identity.part_index, "chunk deleted");
        Ok(true)
    }

    /// Remove every part of a video, on disk and in the index.
    pub fn clear(&self, video_title: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.records.retain(|k, _| k.video_title != video_title);
        let dir = self.video_dir(video_title);
        remove_dir_if_present(&dir)?;
        self.persist(&inner)?;
        info!(video = %video_title, "video cleared");
        Ok(())
    }

    /// Remove everything: parts, staging files, orphans and the index entries.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.records.clear();
        for dir in ["videos", "incoming", "orphaned"] {
            let p = self.root.join(dir);
            remove_dir_if_present(&p)?;
            std::fs::create_dir_all(&p).map_err(|e| StoreError::io("create", &p, e))?;
        }
        self.persist(&inner)?;
        info!("store cleared");
        Ok(())
    }
}

fn remove_file_if_present(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn staged(store: &ChunkStore, identity: &ChunkIdentity, bytes: &[u8]) -> PathBuf {
        let p = store.staging_path(identity).unwrap();
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn record_is_idempotent_first_wins() {
        let (_dir, store) = store();
        let k = ChunkIdentity::new("Dynamic Programming", 0);
        let f1 = staged(&store, &k, b"first");
        let f2 = staged(&store, &k, b"second, slower");

        let r1 = store
            .record_chunk(&k, &f1, AcquisitionSource::Downloaded)
            .unwrap();
        let r2 = store
            .record_chunk(&k, &f2, AcquisitionSource::Received)
            .unwrap();

        assert_eq!(r1, r2);
        assert_eq!(store.list_chunks("Dynamic Programming"), vec![r1.clone()]);
        assert_eq!(std::fs::read(&r1.path).unwrap(), b"first");
        assert_eq!(r1.source, AcquisitionSource::Downloaded);
        assert!(!f2.exists());
        assert_eq!(r1.path, store.part_path(&k));
        assert!(r1.path.ends_with("videos/Dynamic_Programming/part_0.mp4"));
    }

    #[test]
    fn list_is_ordered_by_part_index() {
        let (_dir, store) = store();
        for part in [10u32, 2, 0, 1] {
            let k = ChunkIdentity::new("Sorting", part);
            let f = staged(&store, &k, b"x");
            store
                .record_chunk(&k, &f, AcquisitionSource::Received)
                .unwrap();
        }
        let k = ChunkIdentity::new("Sorting Extra", 0);
        let f = staged(&store, &k, b"x");
        store.record_chunk(&k, &f, AcquisitionSource::Received).unwrap();

        let parts: Vec<u32> = store
            .list_chunks("Sorting")
            .iter()
            .map(|r| r.identity.part_index)
            .collect();
        assert_eq!(parts, vec![0, 1, 2, 10]);
    }

    #[test]
    fn has_chunk_requires_file_on_disk() {
        let (_dir, store) = store();
        let k = ChunkIdentity::new("Heaps", 1);
        assert!(!store.has_chunk(&k));
        let f = staged(&store, &k, b"bytes");
        let r = store
            .record_chunk(&k, &f, AcquisitionSource::Downloaded)
            .unwrap();
        assert!(store.has_chunk(&k));
        std::fs::remove_file(&r.path).unwrap();
        assert!(!store.has_chunk(&k));

        // A vanished file does not block re-recording.
        let f = staged(&store, &k, b"again");
        let r = store
            .record_chunk(&k, &f, AcquisitionSource::Received)
            .unwrap();
        assert_eq!(r.source, AcquisitionSource::Received);
        assert!(store.has_chunk(&k));
    }

    #[test]
    fn index_survives_reopen_and_prunes_missing() {
        let dir = TempDir::new().unwrap();
        let kept = ChunkIdentity::new("Tries", 0);
        let lost = ChunkIdentity::new("Tries", 1);
        {
            let store = ChunkStore::open(dir.path()).unwrap();
            for k in [&kept, &lost] {
                let f = staged(&store, k, b"data");
                store.record_chunk(k, &f, AcquisitionSource::Received).unwrap();
            }
            std::fs::remove_file(store.part_path(&lost)).unwrap();
        }
        let store = ChunkStore::open(dir.path()).unwrap();
        let records = store.list_chunks("Tries");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, kept);
        assert_eq!(records[0].source, AcquisitionSource::Received);
    }

    #[test]
    fn rescan_adopts_existing_part_files() {
        let (_dir, store) = store();
        let k0 = ChunkIdentity::new("Hashing", 0);
        let dir = store.part_path(&k0).parent().unwrap().to_path_buf();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("part_0.mp4"), b"zero").unwrap();
        std::fs::write(dir.join("part_2.mp4"), b"two").unwrap();
        std::fs::write(dir.join(".part_1.abc.tmp"), b"partial").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let adopted = store.rescan("Hashing").unwrap();
        let parts: Vec<u32> = adopted.iter().map(|r| r.identity.part_index).collect();
        assert_eq!(parts, vec![0, 2]);
        assert!(store.has_chunk(&k0));
        assert!(store.rescan("Hashing").unwrap().is_empty());
        assert!(store.rescan("Never Seen").unwrap().is_empty());
    }

    #[test]
    fn orphans_are_kept_and_listed() {
        let (_dir, store) = store();
        let id = TransferId::new();
        let incoming = store.incoming_path(id);
        std::fs::write(&incoming, b"mystery").unwrap();
        let dest = store.adopt_orphan(&incoming, "lecture.mp4").unwrap();
        assert!(!incoming.exists());
        assert_eq!(store.orphans(), vec![dest.clone()]);

        let second = store.incoming_path(TransferId::new());
        std::fs::write(&second, b"another").unwrap();
        let dest2 = store.adopt_orphan(&second, "lecture.mp4").unwrap();
        assert_ne!(dest, dest2);
        assert_eq!(store.orphans().len(), 2);
    }

    #[test]
    fn delete_and_clear() {
        let (_dir, store) = store();
        for part in 0..3 {
            let k = ChunkIdentity::new("Graphs", part);
            let f = staged(&store, &k, b"g");
            store.record_chunk(&k, &f, AcquisitionSource::Downloaded).unwrap();
        }
        let k = ChunkIdentity::new("Trees", 0);
        let f = staged(&store, &k, b"t");
        store.record_chunk(&k, &f, AcquisitionSource::Downloaded).unwrap();

        assert!(store.delete_chunk(&ChunkIdentity::new("Graphs", 1)).unwrap());
        assert!(!store.delete_chunk(&ChunkIdentity::new("Graphs", 1)).unwrap());
        assert_eq!(store.list_chunks("Graphs").len(), 2);

        store.clear("Graphs").unwrap();
        assert!(store.list_chunks("Graphs").is_empty());
        assert!(store.has_chunk(&k));

        store.clear_all().unwrap();
        assert!(store.all_chunks().is_empty());
        assert!(store.root().join("incoming").is_dir());
    }
}

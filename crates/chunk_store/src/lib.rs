//! Content-addressed chunk storage (`spec.md` §4.1).
//!
//! Chunks are stored one file per CID under a two-hex-byte fan-out
//! directory. Writes are atomic (temp file + rename); a second writer of an
//! already-present CID short-circuits to idempotent success rather than
//! re-writing or erroring.

use chiral_proto::Cid;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("permission denied accessing chunk storage: {0}")]
    PermissionDenied(io::Error),
    #[error("chunk {cid} failed integrity check: bytes hash to a different CID")]
    IntegrityMismatch { cid: Cid },
    #[error("chunk {0} not present")]
    Missing(Cid),
    #[error("chunk payload of {len} bytes exceeds configured chunk_size {max}")]
    TooLarge { len: usize, max: usize },
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(err),
            _ => StoreError::Io(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Report produced by a garbage-collection pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub removed: Vec<Cid>,
    pub bytes_freed: u64,
}

pub struct ChunkStore {
    root: PathBuf,
    max_chunk_size: usize,
}

impl ChunkStore {
    /// Opens (creating if necessary) a chunk store rooted at `root/chunks`.
    pub fn open(root: impl Into<PathBuf>, max_chunk_size: usize) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_chunk_size,
        })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.fanout_prefix()).join(cid.to_hex())
    }

    /// Writes `bytes`, returning its CID. Idempotent: if a chunk with the
    /// resulting CID already exists, this is a no-op success.
    pub fn put(&self, bytes: &[u8]) -> StoreResult<Cid> {
        if bytes.len() > self.max_chunk_size {
            return Err(StoreError::TooLarge {
                len: bytes.len(),
                max: self.max_chunk_size,
            });
        }
        let cid = Cid::of(bytes);
        let dest = self.path_for(&cid);
        if dest.exists() {
            return Ok(cid);
        }
        let dir = dest.parent().expect("fan-out dir");
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".tmp-{}", cid.to_hex()));
        fs::write(&tmp, bytes)?;
        // Rename is atomic on the same filesystem; a racing duplicate writer
        // for the same CID will simply rename over the same destination
        // bytes, which is safe because the content is identical by
        // construction (same CID implies same hash preimage class).
        fs::rename(&tmp, &dest)?;
        Ok(cid)
    }

    pub fn get(&self, cid: &Cid) -> StoreResult<Vec<u8>> {
        let path = self.path_for(cid);
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::Missing(*cid),
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(err),
            _ => StoreError::Io(err),
        })?;
        if Cid::of(&bytes) != *cid {
            warn!(subsystem = "chunk_store", %cid, "integrity mismatch on read");
            return Err(StoreError::IntegrityMismatch { cid: *cid });
        }
        Ok(bytes)
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.path_for(cid).exists()
    }

    /// All CIDs currently on disk, regardless of whether a manifest still
    /// references them.
    pub fn iter_all(&self) -> StoreResult<HashSet<Cid>> {
        let mut out = HashSet::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for fanout in fs::read_dir(&self.root)? {
            let fanout = fanout?;
            if !fanout.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fanout.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(".tmp-") {
                    continue;
                }
                if let Ok(cid) = Cid::from_hex(&name) {
                    out.insert(cid);
                }
            }
        }
        Ok(out)
    }

    /// CIDs on disk that are not present in `keep` (SPEC_FULL §C).
    pub fn iter_unreferenced(&self, keep: &HashSet<Cid>) -> StoreResult<HashSet<Cid>> {
        let all = self.iter_all()?;
        Ok(all.difference(keep).copied().collect())
    }

    /// Deletes every chunk not present in `keep`. Run on an explicit host
    /// call, never on a background timer (`spec.md` §9's timer-avoidance
    /// preference generalized to this subsystem).
    pub fn gc(&self, keep: &HashSet<Cid>) -> StoreResult<GcReport> {
        let mut report = GcReport::default();
        for cid in self.iter_unreferenced(keep)? {
            let path = self.path_for(&cid);
            if let Ok(meta) = fs::metadata(&path) {
                report.bytes_freed += meta.len();
            }
            fs::remove_file(&path)?;
            report.removed.push(cid);
        }
        debug!(subsystem = "chunk_store", removed = report.removed.len(), bytes_freed = report.bytes_freed, "gc pass complete");
        Ok(report)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let cid = store.put(b"some chunk bytes").unwrap();
        assert!(store.has(&cid));
        assert_eq!(store.get(&cid).unwrap(), b"some chunk bytes");
    }

    #[test]
    fn duplicate_write_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let a = store.put(b"dup").unwrap();
        let b = store.put(b"dup").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn get_missing_chunk_is_missing_error() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let cid = Cid::of(b"never written");
        assert!(matches!(store.get(&cid), Err(StoreError::Missing(_))));
    }

    #[test]
    fn oversize_chunk_rejected() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 4).unwrap();
        let err = store.put(b"way too big").unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { .. }));
    }

    #[test]
    fn gc_removes_only_unreferenced_chunks() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let keep = store.put(b"keep me").unwrap();
        let drop = store.put(b"drop me").unwrap();
        let mut keep_set = HashSet::new();
        keep_set.insert(keep);
        let report = store.gc(&keep_set).unwrap();
        assert_eq!(report.removed, vec![drop]);
        assert!(store.has(&keep));
        assert!(!store.has(&drop));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_surfaces_as_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let cid = store.put(b"original").unwrap();
        let fanout_dir = store.path_for(&cid).parent().unwrap().to_path_buf();
        fs::set_permissions(&fanout_dir, fs::Permissions::from_mode(0o000)).unwrap();
        let result = store.get(&cid);
        fs::set_permissions(&fanout_dir, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
    }

    #[test]
    fn corrupted_bytes_on_disk_surface_as_integrity_mismatch() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), DEFAULT_CHUNK_SIZE).unwrap();
        let cid = store.put(b"original").unwrap();
        let path = store.path_for(&cid);
        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            store.get(&cid),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }
}

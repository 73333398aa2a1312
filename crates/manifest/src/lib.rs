//! Manifest build/verify/reassemble (`spec.md` §4.2).

use chiral_proto::{Cid, PeerId, PricePerMib};
use chunk_store::ChunkStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] chunk_store::StoreError),
    #[error("manifest is invalid: {0}")]
    Invalid(String),
    #[error("missing chunks during reassembly: {0:?}")]
    MissingChunks(Vec<Cid>),
    #[error("manifest encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Capability-set protocol tag (`spec.md` §9, "dynamic protocol dispatch").
/// Only [`Protocol::Native`] is implemented in this core; the rest are
/// reserved slots for external collaborators behind the same capability
/// interface (`get_providers`, `fetch_chunk`, `start_seeding`, `stop_seeding`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Native,
    BitTorrent,
    Http,
    Ftp,
    Ed2k,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Native
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub index: u32,
    pub cid: Cid,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_name: String,
    pub total_size: u64,
    pub chunks: Vec<ChunkEntry>,
    /// Root of the CID list, present whenever more than one chunk exists.
    pub merkle_root: Option<Cid>,
    /// The root identifier other components advertise in the DHT. Equals
    /// `chunks[0].cid` when the file collapses to a single chunk
    /// (`is_root == true`), otherwise equals `merkle_root`.
    pub root_cid: Cid,
    pub is_root: bool,
    pub encryption_bundle: Option<Vec<u8>>,
    pub price_per_mib: Option<PricePerMib>,
    #[serde(default)]
    pub protocol: Protocol,
    pub encoded_by: Option<PeerId>,
}

/// Builds the Merkle root over an ordered CID list using a simple
/// binary tree with last-node duplication for odd levels.
pub fn merkle_root(cids: &[Cid]) -> Cid {
    assert!(!cids.is_empty(), "merkle_root requires at least one leaf");
    let mut level: Vec<Cid> = cids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(&pair[0].0);
            buf.extend_from_slice(&pair.get(1).unwrap_or(&pair[0]).0);
            next.push(Cid::of(&buf));
        }
        level = next;
    }
    level[0]
}

pub fn build(
    file_path: impl AsRef<Path>,
    chunk_size: usize,
    store: &ChunkStore,
) -> ManifestResult<Manifest> {
    let file_path = file_path.as_ref();
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut chunks = Vec::new();
    let mut total_size: u64 = 0;
    let mut buf = vec![0u8; chunk_size];
    let mut index: u32 = 0;
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let cid = store.put(&buf[..filled])?;
        chunks.push(ChunkEntry {
            index,
            cid,
            size: filled as u32,
        });
        total_size += filled as u64;
        index += 1;
        if filled < buf.len() {
            break;
        }
    }
    if chunks.is_empty() {
        let cid = store.put(&[])?;
        chunks.push(ChunkEntry {
            index: 0,
            cid,
            size: 0,
        });
    }

    let cids: Vec<Cid> = chunks.iter().map(|c| c.cid).collect();
    let (merkle_root_val, root_cid, is_root) = if cids.len() == 1 {
        (None, cids[0], true)
    } else {
        let root = merkle_root(&cids);
        (Some(root), root, false)
    };

    debug!(subsystem = "manifest", file_name = %file_name, chunks = chunks.len(), total_size, %root_cid, "manifest built");
    Ok(Manifest {
        file_name,
        total_size,
        chunks,
        merkle_root: merkle_root_val,
        root_cid,
        is_root,
        encryption_bundle: None,
        price_per_mib: None,
        protocol: Protocol::Native,
        encoded_by: None,
    })
}

impl Manifest {
    /// Checks internal consistency (`size == Σ chunk.size`, Merkle root
    /// matches the chunk list) and that every referenced chunk CID is in
    /// `chunks_present`.
    pub fn verify(&self, chunks_present: &HashSet<Cid>) -> bool {
        let expected: u64 = self.chunks.iter().map(|c| c.size as u64).sum();
        if expected != self.total_size {
            return false;
        }
        let cids: Vec<Cid> = self.chunks.iter().map(|c| c.cid).collect();
        match (self.is_root, self.merkle_root) {
            (true, _) => {
                if cids.len() != 1 || cids[0] != self.root_cid {
                    return false;
                }
            }
            (false, Some(root)) => {
                if cids.len() < 2 || merkle_root(&cids) != root || root != self.root_cid {
                    return false;
                }
            }
            (false, None) => return false,
        }
        self.chunks.iter().all(|c| chunks_present.contains(&c.cid))
    }

    pub fn missing_chunks(&self, store: &ChunkStore) -> Vec<Cid> {
        self.chunks
            .iter()
            .filter(|c| !store.has(&c.cid))
            .map(|c| c.cid)
            .collect()
    }

    pub fn encode(&self) -> ManifestResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ManifestResult<Manifest> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Streams chunks in order to `out_path`. Fails with
/// [`ManifestError::MissingChunks`] listing every gap rather than the first
/// one, so the caller can decide which peers to re-request from in one pass.
pub fn reassemble(
    manifest: &Manifest,
    store: &ChunkStore,
    out_path: impl AsRef<Path>,
) -> ManifestResult<()> {
    let missing = manifest.missing_chunks(store);
    if !missing.is_empty() {
        return Err(ManifestError::MissingChunks(missing));
    }
    let mut out = File::create(out_path)?;
    let mut ordered = manifest.chunks.clone();
    ordered.sort_by_key(|c| c.index);
    for entry in &ordered {
        let bytes = store.get(&entry.cid)?;
        out.write_all(&bytes)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_then_reassemble_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), 16).unwrap();
        let input_path = dir.path().join("input.bin");
        let data: Vec<u8> = (0u8..200).collect();
        std::fs::write(&input_path, &data).unwrap();

        let manifest = build(&input_path, 16, &store).unwrap();
        assert_eq!(manifest.total_size, data.len() as u64);
        assert_eq!(manifest.chunks.len(), 13); // 200 / 16 = 12.5 -> 13 chunks

        let out_path = dir.path().join("output.bin");
        reassemble(&manifest, &store, &out_path).unwrap();
        let produced = std::fs::read(&out_path).unwrap();
        assert_eq!(produced, data);
    }

    #[test]
    fn single_chunk_file_is_its_own_root() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), 256 * 1024).unwrap();
        let input_path = dir.path().join("small.bin");
        std::fs::write(&input_path, b"tiny").unwrap();
        let manifest = build(&input_path, 256 * 1024, &store).unwrap();
        assert!(manifest.is_root);
        assert_eq!(manifest.chunks.len(), 1);
        assert_eq!(manifest.root_cid, manifest.chunks[0].cid);
        assert!(manifest.merkle_root.is_none());
    }

    #[test]
    fn verify_detects_size_mismatch() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), 16).unwrap();
        let input_path = dir.path().join("input.bin");
        std::fs::write(&input_path, vec![7u8; 40]).unwrap();
        let mut manifest = build(&input_path, 16, &store).unwrap();
        manifest.total_size += 1;
        let present: HashSet<Cid> = manifest.chunks.iter().map(|c| c.cid).collect();
        assert!(!manifest.verify(&present));
    }

    #[test]
    fn reassemble_reports_every_missing_chunk() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), 16).unwrap();
        let input_path = dir.path().join("input.bin");
        std::fs::write(&input_path, vec![3u8; 48]).unwrap();
        let manifest = build(&input_path, 16, &store).unwrap();

        let fresh_dir = tempdir().unwrap();
        let empty_store = ChunkStore::open(fresh_dir.path().join("store"), 16).unwrap();
        let out_path = fresh_dir.path().join("out.bin");
        let err = reassemble(&manifest, &empty_store, &out_path).unwrap_err();
        match err {
            ManifestError::MissingChunks(missing) => assert_eq!(missing.len(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("store"), 16).unwrap();
        let input_path = dir.path().join("input.bin");
        std::fs::write(&input_path, vec![9u8; 32]).unwrap();
        let manifest = build(&input_path, 16, &store).unwrap();
        let encoded = manifest.encode().unwrap();
        let decoded = Manifest::decode(&encoded).unwrap();
        assert_eq!(manifest, decoded);
    }
}

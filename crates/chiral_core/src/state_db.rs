//! `state.db`: small namespaced key-value store for settings, pinned roots,
//! the relay pool snapshot and checkpoint sessions (`spec.md` §6,
//! `SPEC_FULL.md` §C). Backed by `sled`, an embedded store that needs no
//! separate server process for a single-node host.

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StateDbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type StateDbResult<T> = Result<T, StateDbError>;

/// Key namespaces this store is organized under.
pub mod ns {
    pub const RELAY: &str = "relay";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const PIN: &str = "pin";
    pub const CONFIG: &str = "config";
}

pub struct StateDb {
    db: sled::Db,
}

impl StateDb {
    pub fn open(path: impl AsRef<Path>) -> StateDbResult<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    fn full_key(namespace: &str, key: &str) -> Vec<u8> {
        format!("{namespace}/{key}").into_bytes()
    }

    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> StateDbResult<()> {
        let bytes = bincode::serialize(value)?;
        self.db.insert(Self::full_key(namespace, key), bytes)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> StateDbResult<Option<T>> {
        match self.db.get(Self::full_key(namespace, key))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, namespace: &str, key: &str) -> StateDbResult<()> {
        self.db.remove(Self::full_key(namespace, key))?;
        Ok(())
    }

    /// All values stored under `namespace`, in arbitrary key order.
    pub fn scan<T: DeserializeOwned>(&self, namespace: &str) -> StateDbResult<Vec<T>> {
        let prefix = format!("{namespace}/");
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    pub fn flush(&self) -> StateDbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        n: u32,
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        db.put(ns::CONFIG, "a", &Dummy { n: 1 }).unwrap();
        let got: Option<Dummy> = db.get(ns::CONFIG, "a").unwrap();
        assert_eq!(got, Some(Dummy { n: 1 }));
    }

    #[test]
    fn scan_only_returns_matching_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        db.put(ns::PIN, "root1", &Dummy { n: 1 }).unwrap();
        db.put(ns::PIN, "root2", &Dummy { n: 2 }).unwrap();
        db.put(ns::RELAY, "r1", &Dummy { n: 3 }).unwrap();
        let pins: Vec<Dummy> = db.scan(ns::PIN).unwrap();
        assert_eq!(pins.len(), 2);
    }

    #[test]
    fn remove_drops_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        db.put(ns::CONFIG, "a", &Dummy { n: 1 }).unwrap();
        db.remove(ns::CONFIG, "a").unwrap();
        let got: Option<Dummy> = db.get(ns::CONFIG, "a").unwrap();
        assert!(got.is_none());
    }
}

mod fjall_store;
mod memory_store;
mod traits;

use std::path::Path;
use std::sync::Arc;

pub use fjall_store::FjallStore;
pub use memory_store::MemoryStore;
pub use traits::{
    BaseMetaTree, Durability, KvIter, KvPair, MetaTreeExt, StorageEngine, Store, WriteBatch,
};

use crate::error::MetaError;

/// Opens the metadata store selected by `engine` rooted at `meta_root`.
pub fn open_store(
    engine: StorageEngine,
    meta_root: &Path,
    durability: Option<Durability>,
) -> Result<Arc<dyn Store>, MetaError> {
    match engine {
        StorageEngine::Fjall => Ok(Arc::new(FjallStore::open(meta_root.join("db"), durability)?)),
        StorageEngine::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Encodes a record with the workspace-wide bincode configuration.
pub(crate) fn encode<T: serde::Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        MetaError::Encode {
            what,
            reason: e.to_string(),
        }
    })
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    what: &'static str,
    raw: &[u8],
) -> Result<T, MetaError> {
    let (value, _len) = bincode::serde::decode_from_slice(raw, bincode::config::standard())
        .map_err(|e| MetaError::Decode {
            what,
            reason: e.to_string(),
        })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fjall_store_round_trip_and_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(StorageEngine::Fjall, dir.path(), Some(Durability::Buffer)).unwrap();

        let tree = store.tree_open("_TEST").unwrap();
        tree.insert(b"a", b"1".to_vec()).unwrap();

        let mut batch = store.batch();
        batch.insert("_TEST", b"b", b"2".to_vec()).unwrap();
        batch.insert("_OTHER", b"c", b"3".to_vec()).unwrap();
        batch.remove("_TEST", b"a").unwrap();
        batch.commit().unwrap();

        assert_eq!(tree.get(b"a").unwrap(), None);
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.num_keys("_OTHER").unwrap(), 1);

        let after: Vec<Vec<u8>> = tree.range_after(b"a").map(|r| r.unwrap().0).collect();
        assert_eq!(after, vec![b"b".to_vec()]);
    }

    #[test]
    fn test_fjall_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(StorageEngine::Fjall, dir.path(), None).unwrap();
            store.tree_open("_TEST").unwrap().insert(b"k", b"v".to_vec()).unwrap();
            store.persist().unwrap();
        }
        let store = open_store(StorageEngine::Fjall, dir.path(), None).unwrap();
        let tree = store.tree_open("_TEST").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_trees_are_debug() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(StorageEngine::Fjall, dir.path(), None).unwrap();
        let tree = store.tree_open("_TEST").unwrap();
        assert!(format!("{tree:?}").contains("_TEST"));

        let memory = open_store(StorageEngine::Memory, dir.path(), None).unwrap();
        let _ = format!("{:?}", memory.tree_open("_TEST").unwrap());
    }
}

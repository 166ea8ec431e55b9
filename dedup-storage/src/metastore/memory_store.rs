use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{BaseMetaTree, KvIter, KvPair, MetaTreeExt, Store, WriteBatch};
use crate::error::MetaError;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

fn poisoned() -> MetaError {
    MetaError::Backend("memory store lock poisoned".to_string())
}

/// In-process metadata store. Trees are ordered maps; nothing survives the
/// process. Iterators work on a snapshot taken when they are created.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    trees: Arc<RwLock<HashMap<String, Arc<MemoryTree>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self, name: &str) -> Result<Arc<MemoryTree>, MetaError> {
        {
            let trees = self.trees.read().map_err(|_| poisoned())?;
            if let Some(tree) = trees.get(name) {
                return Ok(Arc::clone(tree));
            }
        }

        let mut trees = self.trees.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(trees.entry(name.to_string()).or_default()))
    }
}

impl Store for MemoryStore {
    fn tree_open(&self, name: &str) -> Result<Arc<dyn MetaTreeExt>, MetaError> {
        Ok(self.tree(name)?)
    }

    fn batch(&self) -> Box<dyn WriteBatch> {
        Box::new(MemoryBatch {
            store: self.clone(),
            ops: Vec::new(),
        })
    }

    fn num_keys(&self, tree: &str) -> Result<usize, MetaError> {
        Ok(self.tree(tree)?.read()?.len())
    }

    fn disk_space(&self) -> u64 {
        0
    }

    fn persist(&self) -> Result<(), MetaError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTree {
    map: RwLock<Map>,
}

impl MemoryTree {
    fn read(&self) -> Result<RwLockReadGuard<'_, Map>, MetaError> {
        self.map.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Map>, MetaError> {
        self.map.write().map_err(|_| poisoned())
    }

    fn snapshot<F>(&self, select: F) -> KvIter<'_>
    where
        F: FnOnce(&Map) -> Vec<KvPair>,
    {
        match self.read() {
            Ok(map) => Box::new(select(&map).into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }
}

impl BaseMetaTree for MemoryTree {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), MetaError> {
        self.write()?.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), MetaError> {
        self.write()?.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.read()?.contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self.read()?.get(key).cloned())
    }
}

impl MetaTreeExt for MemoryTree {
    fn iter_all(&self) -> KvIter<'_> {
        self.snapshot(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn prefix(&self, prefix: &[u8]) -> KvIter<'_> {
        let prefix = prefix.to_vec();
        self.snapshot(move |map| {
            map.range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn range_after(&self, key: &[u8]) -> KvIter<'_> {
        let start = key.to_vec();
        self.snapshot(move |map| {
            map.range((Bound::Excluded(start), Bound::Unbounded))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }
}

enum BatchOp {
    Insert(String, Vec<u8>, Vec<u8>),
    Remove(String, Vec<u8>),
}

impl BatchOp {
    fn tree(&self) -> &str {
        match self {
            BatchOp::Insert(tree, _, _) | BatchOp::Remove(tree, _) => tree,
        }
    }
}

struct MemoryBatch {
    store: MemoryStore,
    ops: Vec<BatchOp>,
}

impl WriteBatch for MemoryBatch {
    fn insert(&mut self, tree: &str, key: &[u8], value: Vec<u8>) -> Result<(), MetaError> {
        self.ops
            .push(BatchOp::Insert(tree.to_string(), key.to_vec(), value));
        Ok(())
    }

    fn remove(&mut self, tree: &str, key: &[u8]) -> Result<(), MetaError> {
        self.ops.push(BatchOp::Remove(tree.to_string(), key.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), MetaError> {
        // Lock every touched tree in name order, then apply. Readers never see
        // half a batch and two batches cannot deadlock.
        let mut names: Vec<&str> = self.ops.iter().map(BatchOp::tree).collect();
        names.sort_unstable();
        names.dedup();

        let trees = names
            .iter()
            .map(|name| self.store.tree(name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards = trees
            .iter()
            .map(|tree| tree.write())
            .collect::<Result<Vec<_>, _>>()?;

        for op in &self.ops {
            let idx = names
                .binary_search(&op.tree())
                .map_err(|_| MetaError::Backend("batch tree vanished".to_string()))?;
            match op {
                BatchOp::Insert(_, key, value) => {
                    guards[idx].insert(key.clone(), value.clone());
                }
                BatchOp::Remove(_, key) => {
                    guards[idx].remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let store = MemoryStore::new();
        let tree = store.tree_open("t").unwrap();
        tree.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(tree.contains_key(b"k").unwrap());
        tree.remove(b"k").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_prefix_and_range_order() {
        let store = MemoryStore::new();
        let tree = store.tree_open("t").unwrap();
        for key in ["b/2", "a/1", "b/1", "c/1"] {
            tree.insert(key.as_bytes(), Vec::new()).unwrap();
        }

        let keys: Vec<Vec<u8>> = tree.prefix(b"b/").map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec![b"b/1".to_vec(), b"b/2".to_vec()]);

        let keys: Vec<Vec<u8>> = tree.range_after(b"b/1").map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec![b"b/2".to_vec(), b"c/1".to_vec()]);
    }

    #[test]
    fn test_batch_spans_trees() {
        let store = MemoryStore::new();
        let a = store.tree_open("a").unwrap();
        a.insert(b"gone", Vec::new()).unwrap();

        let mut batch = store.batch();
        batch.insert("a", b"x", b"1".to_vec()).unwrap();
        batch.insert("b", b"y", b"2".to_vec()).unwrap();
        batch.remove("a", b"gone").unwrap();
        batch.commit().unwrap();

        let b = store.tree_open("b").unwrap();
        assert_eq!(a.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(b.get(b"y").unwrap(), Some(b"2".to_vec()));
        assert!(!a.contains_key(b"gone").unwrap());
        assert_eq!(store.num_keys("a").unwrap(), 1);
    }
}

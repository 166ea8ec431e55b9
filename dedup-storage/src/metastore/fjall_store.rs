use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::traits::{BaseMetaTree, Durability, KvIter, MetaTreeExt, Store, WriteBatch};
use crate::error::MetaError;

fn persist_mode(durability: Durability) -> PersistMode {
    match durability {
        Durability::Buffer => PersistMode::Buffer,
        Durability::Fsync => PersistMode::SyncAll,
        Durability::Fdatasync => PersistMode::SyncData,
    }
}

/// Metadata store on top of a fjall keyspace. Every tree is a fjall partition.
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    durability: Option<Durability>,
}

impl std::fmt::Debug for FjallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallStore")
            .field("durability", &self.durability)
            .finish()
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>, durability: Option<Durability>) -> Result<Self, MetaError> {
        let path = path.as_ref();
        debug!(path = %path.display(), ?durability, "opening fjall keyspace");
        let keyspace = Config::new(path).open()?;
        Ok(Self {
            keyspace,
            durability,
        })
    }

    fn partition(&self, name: &str) -> Result<PartitionHandle, MetaError> {
        Ok(self
            .keyspace
            .open_partition(name, PartitionCreateOptions::default())?)
    }

    fn sync_after_write(&self) -> Result<(), MetaError> {
        match self.durability {
            None | Some(Durability::Buffer) => Ok(()),
            Some(d) => Ok(self.keyspace.persist(persist_mode(d))?),
        }
    }
}

impl Store for FjallStore {
    fn tree_open(&self, name: &str) -> Result<Arc<dyn MetaTreeExt>, MetaError> {
        let partition = self.partition(name)?;
        Ok(Arc::new(FjallTree {
            store: self.clone(),
            partition,
        }))
    }

    fn batch(&self) -> Box<dyn WriteBatch> {
        let mut batch = self.keyspace.batch();
        if let Some(d) = self.durability {
            batch = batch.durability(Some(persist_mode(d)));
        }
        Box::new(FjallBatch {
            store: self.clone(),
            batch,
        })
    }

    fn num_keys(&self, tree: &str) -> Result<usize, MetaError> {
        Ok(self.partition(tree)?.len()?)
    }

    fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }

    fn persist(&self) -> Result<(), MetaError> {
        let mode = persist_mode(self.durability.unwrap_or(Durability::Fsync));
        Ok(self.keyspace.persist(mode)?)
    }
}

struct FjallTree {
    store: FjallStore,
    partition: PartitionHandle,
}

impl std::fmt::Debug for FjallTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name: &str = &self.partition.name;
        f.debug_struct("FjallTree").field("partition", &name).finish()
    }
}

fn convert_iter<'a, I, K, V>(iter: I) -> KvIter<'a>
where
    I: Iterator<Item = fjall::Result<(K, V)>> + 'a,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    Box::new(iter.map(|item| {
        item.map(|(k, v)| (k.as_ref().to_vec(), v.as_ref().to_vec()))
            .map_err(MetaError::from)
    }))
}

impl BaseMetaTree for FjallTree {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), MetaError> {
        self.partition.insert(key, value)?;
        self.store.sync_after_write()
    }

    fn remove(&self, key: &[u8]) -> Result<(), MetaError> {
        self.partition.remove(key)?;
        self.store.sync_after_write()
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.partition.contains_key(key)?)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }
}

impl MetaTreeExt for FjallTree {
    fn iter_all(&self) -> KvIter<'_> {
        convert_iter(self.partition.iter())
    }

    fn prefix(&self, prefix: &[u8]) -> KvIter<'_> {
        convert_iter(self.partition.prefix(prefix))
    }

    fn range_after(&self, key: &[u8]) -> KvIter<'_> {
        let bounds: (Bound<Vec<u8>>, Bound<Vec<u8>>) =
            (Bound::Excluded(key.to_vec()), Bound::Unbounded);
        convert_iter(self.partition.range(bounds))
    }
}

struct FjallBatch {
    store: FjallStore,
    batch: Batch,
}

impl WriteBatch for FjallBatch {
    fn insert(&mut self, tree: &str, key: &[u8], value: Vec<u8>) -> Result<(), MetaError> {
        let partition = self.store.partition(tree)?;
        self.batch.insert(&partition, key, value);
        Ok(())
    }

    fn remove(&mut self, tree: &str, key: &[u8]) -> Result<(), MetaError> {
        let partition = self.store.partition(tree)?;
        self.batch.remove(&partition, key);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), MetaError> {
        Ok(self.batch.commit()?)
    }
}

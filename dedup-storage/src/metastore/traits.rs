use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::MetaError;

/// Key-value pair as returned by tree iterators.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy iterator over a tree.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, MetaError>> + 'a>;

/// Store is the interface to the metadata backend.
///
/// It hands out named trees and atomic write batches spanning several trees.
/// Implementations must be safe to share between threads.
pub trait Store: Send + Sync + Debug + 'static {
    /// Opens (creating if needed) the tree with the given name.
    fn tree_open(&self, name: &str) -> Result<Arc<dyn MetaTreeExt>, MetaError>;

    /// Starts a batch of writes that are applied all together or not at all.
    fn batch(&self) -> Box<dyn WriteBatch>;

    /// Returns the number of keys in the tree with the given name.
    fn num_keys(&self, tree: &str) -> Result<usize, MetaError>;

    /// Returns the disk space used by the metadata store.
    fn disk_space(&self) -> u64;

    /// Flushes buffered writes according to the configured durability.
    fn persist(&self) -> Result<(), MetaError>;
}

/// BaseMetaTree provides basic tree operations for metadata storage.
pub trait BaseMetaTree: Send + Sync + Debug {
    /// Inserts a key-value pair into the tree.
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), MetaError>;

    /// Removes a key from the tree.
    fn remove(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Checks if the tree contains the given key.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError>;

    /// Gets the value associated with the given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;
}

/// MetaTreeExt adds ordered iteration. Keys are yielded in ascending byte order.
pub trait MetaTreeExt: BaseMetaTree {
    /// Iterates over every entry of the tree.
    fn iter_all(&self) -> KvIter<'_>;

    /// Iterates over the entries whose key starts with `prefix`.
    fn prefix(&self, prefix: &[u8]) -> KvIter<'_>;

    /// Iterates over the entries whose key sorts strictly after `key`.
    fn range_after(&self, key: &[u8]) -> KvIter<'_>;
}

/// A set of writes across trees, committed atomically.
pub trait WriteBatch: Send {
    fn insert(&mut self, tree: &str, key: &[u8], value: Vec<u8>) -> Result<(), MetaError>;

    fn remove(&mut self, tree: &str, key: &[u8]) -> Result<(), MetaError>;

    fn commit(self: Box<Self>) -> Result<(), MetaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Buffer,
    Fsync,
    Fdatasync,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}

/// Metadata backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEngine {
    /// Persistent fjall keyspace
    Fjall,
    /// Process-local maps, lost on exit
    Memory,
}

impl FromStr for StorageEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fjall" => Ok(StorageEngine::Fjall),
            "memory" => Ok(StorageEngine::Memory),
            _ => Err(format!("Unknown metadata engine: {}", s)),
        }
    }
}

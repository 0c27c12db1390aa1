//! Database abstraction layer
//!
//! A thin trait boundary over the embedded key-value store so the registry
//! never depends on a concrete engine. The batch writer is the one
//! transaction primitive: all registry rows live in a single tree, so one
//! batch commit covers every entity type atomically.

use anyhow::Result;
use std::path::Path;

/// Database abstraction trait
pub trait Database: Send + Sync {
    /// Open a named tree/table
    fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>>;

    /// Flush all pending writes to durable storage
    fn flush(&self) -> Result<()>;
}

/// Tree/Table abstraction trait
///
/// A named collection of key-value pairs within a database.
pub trait Tree: Send + Sync {
    /// Insert a key-value pair
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remove a key-value pair
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Iterate over all key-value pairs
    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_>;

    /// Create a batch writer for atomic multi-key commits
    ///
    /// All operations in a batch are committed atomically: either every put
    /// and delete lands, or none do. A crash mid-commit never leaves a
    /// partially-applied batch visible on reopen.
    fn batch(&self) -> Box<dyn BatchWriter + '_>;
}

/// Batch writer accumulating puts/deletes for one atomic commit.
pub trait BatchWriter {
    /// Add a key-value pair to the batch
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Mark a key for deletion in the batch
    fn delete(&mut self, key: &[u8]);

    /// Commit all batched operations atomically
    fn commit(self: Box<Self>) -> Result<()>;

    /// Number of pending operations in the batch
    fn len(&self) -> usize;

    /// Check if the batch is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open the default embedded database at `data_dir`.
pub fn open_database<P: AsRef<Path>>(data_dir: P) -> Result<Box<dyn Database>> {
    Ok(Box::new(sled_impl::SledDatabase::new(data_dir)?))
}

mod sled_impl {
    use super::{BatchWriter, Database, Tree};
    use anyhow::Result;
    use std::path::Path;
    use std::sync::Arc;

    pub struct SledDatabase {
        db: Arc<sled::Db>,
    }

    impl SledDatabase {
        pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
            let db = sled::open(data_dir)?;
            Ok(Self { db: Arc::new(db) })
        }
    }

    impl Database for SledDatabase {
        fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>> {
            let tree = self.db.open_tree(name)?;
            Ok(Box::new(SledTree { tree }))
        }

        fn flush(&self) -> Result<()> {
            self.db.flush()?;
            Ok(())
        }
    }

    struct SledTree {
        tree: sled::Tree,
    }

    impl Tree for SledTree {
        fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.tree.insert(key, value)?;
            Ok(())
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.tree.get(key)?.map(|v| v.to_vec()))
        }

        fn remove(&self, key: &[u8]) -> Result<()> {
            self.tree.remove(key)?;
            Ok(())
        }

        fn iter(&self) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_> {
            Box::new(self.tree.iter().map(|item| {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            }))
        }

        fn batch(&self) -> Box<dyn BatchWriter + '_> {
            Box::new(SledBatch {
                tree: &self.tree,
                batch: sled::Batch::default(),
                pending: 0,
            })
        }
    }

    struct SledBatch<'a> {
        tree: &'a sled::Tree,
        batch: sled::Batch,
        pending: usize,
    }

    impl BatchWriter for SledBatch<'_> {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.batch.insert(key, value);
            self.pending += 1;
        }

        fn delete(&mut self, key: &[u8]) {
            self.batch.remove(key);
            self.pending += 1;
        }

        fn commit(self: Box<Self>) -> Result<()> {
            let SledBatch { tree, batch, .. } = *self;
            tree.apply_batch(batch)?;
            Ok(())
        }

        fn len(&self) -> usize {
            self.pending
        }
    }
}

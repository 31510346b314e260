//! Block storage interface and in-memory implementation.
//!
//! An append-only log of block elements keyed by height, each saved
//! together with the undo data needed to rewind it. The in-memory store
//! backs tests and light configurations; a durable backend implements the
//! same trait. `save_block` must not return until the block and its undo
//! data are durable.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use karst_core::element::BlockElement;
use karst_core::error::StorageError;
use karst_core::types::{Block, Hash256};

use crate::snapshot::BlockUndo;

/// Append-only indexed block log.
pub trait BlockStorage: Send + Sync {
    /// Height of the highest stored block.
    fn chain_height(&self) -> u64;

    /// Append a block element and its undo data at the next height.
    fn save_block(&self, element: BlockElement, undo: BlockUndo) -> Result<(), StorageError>;

    /// Load a block by height.
    fn load_block(&self, height: u64) -> Result<Option<Block>, StorageError>;

    /// Load a block element by height.
    fn load_block_element(&self, height: u64) -> Result<Option<BlockElement>, StorageError>;

    /// Load a block's undo data by height.
    fn load_undo(&self, height: u64) -> Result<Option<BlockUndo>, StorageError>;

    /// Drop every block strictly above `height`.
    fn drop_blocks_after(&self, height: u64) -> Result<(), StorageError>;

    /// Entity hashes of up to `max` blocks starting at `height`, ascending.
    fn load_hashes_from(&self, height: u64, max: usize) -> Result<Vec<Hash256>, StorageError>;
}

/// In-memory block storage for tests and light configurations.
pub struct MemoryBlockStorage {
    inner: RwLock<BTreeMap<u64, (BlockElement, BlockUndo)>>,
}

impl MemoryBlockStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self { inner: RwLock::new(BTreeMap::new()) }
    }

    /// A store holding only `genesis_element` at height 1.
    pub fn with_genesis(genesis_element: BlockElement) -> Self {
        let store = Self::new();
        store
            .inner
            .write()
            .insert(genesis_element.block.height, (genesis_element, BlockUndo::default()));
        store
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for MemoryBlockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn chain_height(&self) -> u64 {
        self.inner.read().keys().next_back().copied().unwrap_or(0)
    }

    fn save_block(&self, element: BlockElement, undo: BlockUndo) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let expected = inner.keys().next_back().map(|h| h + 1).unwrap_or(element.block.height);
        if element.block.height != expected {
            return Err(StorageError::NonContiguousSave { expected, got: element.block.height });
        }
        inner.insert(element.block.height, (element, undo));
        Ok(())
    }

    fn load_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.inner.read().get(&height).map(|(e, _)| e.block.clone()))
    }

    fn load_block_element(&self, height: u64) -> Result<Option<BlockElement>, StorageError> {
        Ok(self.inner.read().get(&height).map(|(e, _)| e.clone()))
    }

    fn load_undo(&self, height: u64) -> Result<Option<BlockUndo>, StorageError> {
        Ok(self.inner.read().get(&height).map(|(_, u)| u.clone()))
    }

    fn drop_blocks_after(&self, height: u64) -> Result<(), StorageError> {
        self.inner.write().retain(|h, _| *h <= height);
        Ok(())
    }

    fn load_hashes_from(&self, height: u64, max: usize) -> Result<Vec<Hash256>, StorageError> {
        Ok(self
            .inner
            .read()
            .range(height..)
            .take(max)
            .map(|(_, (e, _))| e.entity_hash)
            .collect())
    }
}

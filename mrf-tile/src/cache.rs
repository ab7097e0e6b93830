//! Decoded block cache of a pyramid.

use crate::index::TileCoord;
use lru::LruCache;

/// One band of one page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub level: usize,
    pub band: usize,
    pub x: usize,
    pub y: usize,
}

impl BlockKey {
    #[must_use]
    pub const fn new(level: usize, band: usize, x: usize, y: usize) -> Self {
        Self { level, band, x, y }
    }

    #[must_use]
    pub const fn with_band(self, band: usize) -> Self {
        Self { band, ..self }
    }

    /// Page holding this block when pages carry `channels` bands.
    #[must_use]
    pub const fn coord(&self, channels: usize) -> TileCoord {
        TileCoord::new(self.x, self.y, self.band / channels, self.level)
    }
}

/// Blocks kept before least recently used clean blocks are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    data: Vec<u8>,
    dirty: bool,
}

/// Decoded blocks in host byte order, with a dirty flag for blocks that
/// hold changes not yet written to the store.
///
/// Eviction drops the least recently used clean blocks. A clean block is
/// kept while another band of its page is dirty, since writing that page
/// gathers every band of it from the cache.
pub struct BlockCache {
    blocks: LruCache<BlockKey, Entry>,
    capacity: usize,
    channels: usize,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("len", &self.blocks.len())
            .field("capacity", &self.capacity)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, 1)
    }

    /// A cache for pages carrying `channels` bands.
    #[must_use]
    pub fn with_capacity(capacity: usize, channels: usize) -> Self {
        Self {
            blocks: LruCache::unbounded(),
            capacity: capacity.max(1),
            channels: channels.max(1),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether the cache holds at least as many blocks as its capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    #[must_use]
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.blocks.contains(key)
    }

    /// Returns a block without touching the recency order.
    #[must_use]
    pub fn get(&self, key: &BlockKey) -> Option<&[u8]> {
        self.blocks.peek(key).map(|e| e.data.as_slice())
    }

    /// Mutable access to a block, which becomes dirty.
    pub fn get_mut(&mut self, key: &BlockKey) -> Option<&mut [u8]> {
        self.blocks.get_mut(key).map(|e| {
            e.dirty = true;
            e.data.as_mut_slice()
        })
    }

    #[must_use]
    pub fn is_dirty(&self, key: &BlockKey) -> bool {
        self.blocks.peek(key).is_some_and(|e| e.dirty)
    }

    /// Whether any band of the page holding `key` is dirty.
    #[must_use]
    pub fn is_page_dirty(&self, key: &BlockKey) -> bool {
        let first = key.band / self.channels * self.channels;
        (first..first + self.channels).any(|band| self.is_dirty(&key.with_band(band)))
    }

    /// Stores a block, replacing any previous content.
    pub fn insert(&mut self, key: BlockKey, data: Vec<u8>, dirty: bool) {
        self.blocks.put(key, Entry { data, dirty });
    }

    /// Stores a clean block unless the cache holds unsaved changes for it.
    ///
    /// Returns `true` if the block was stored.
    pub fn offer(&mut self, key: BlockKey, data: Vec<u8>) -> bool {
        if self.is_dirty(&key) {
            return false;
        }

        self.insert(key, data, false);
        true
    }

    /// Returns a block, reading it with `read` when it is not cached yet.
    pub fn load<E>(
        &mut self,
        key: BlockKey,
        read: impl FnOnce(&mut Self) -> Result<Vec<u8>, E>,
    ) -> Result<&[u8], E> {
        Ok(self.entry(key, read)?.data.as_slice())
    }

    /// Same as [`load()`](Self::load), the block becomes dirty.
    pub fn load_mut<E>(
        &mut self,
        key: BlockKey,
        read: impl FnOnce(&mut Self) -> Result<Vec<u8>, E>,
    ) -> Result<&mut [u8], E> {
        let entry = self.entry(key, read)?;
        entry.dirty = true;
        Ok(entry.data.as_mut_slice())
    }

    fn entry<E>(
        &mut self,
        key: BlockKey,
        read: impl FnOnce(&mut Self) -> Result<Vec<u8>, E>,
    ) -> Result<&mut Entry, E> {
        let loaded = if self.blocks.contains(&key) {
            None
        } else {
            Some(read(self)?)
        };

        Ok(self.blocks.get_or_insert_mut(key, || Entry {
            data: loaded.unwrap_or_default(),
            dirty: false,
        }))
    }

    pub fn mark_clean(&mut self, key: &BlockKey) {
        if let Some(e) = self.blocks.peek_mut(key) {
            e.dirty = false;
        }
    }

    /// Dirty blocks, sorted by level, band and position.
    #[must_use]
    pub fn dirty_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self
            .blocks
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| *k)
            .collect();

        keys.sort_unstable();
        keys
    }

    pub fn remove(&mut self, key: &BlockKey) -> Option<Vec<u8>> {
        self.blocks.pop(key).map(|e| e.data)
    }

    /// Drops least recently used clean blocks until at most `keep` blocks
    /// remain. Returns the number of blocks dropped.
    pub fn evict(&mut self, keep: usize) -> usize {
        let excess = self.blocks.len().saturating_sub(keep);

        if excess == 0 {
            return 0;
        }

        let victims: Vec<BlockKey> = self
            .blocks
            .iter()
            .rev()
            .filter(|(k, e)| !e.dirty && !self.is_page_dirty(k))
            .map(|(k, _)| *k)
            .take(excess)
            .collect();

        for key in &victims {
            self.blocks.pop(key);
        }

        victims.len()
    }

    /// Drops every clean block whose page has no unsaved band.
    pub fn evict_clean(&mut self) -> usize {
        self.evict(0)
    }
}

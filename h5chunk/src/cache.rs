//! The raw data chunk cache.
//!
//! Each dataset owns a [`ChunkCache`] of decoded chunks, bounded by a number of hash slots and a byte budget (see [`ChunkCacheConfig`]).
//! A chunk occupies the slot given by a hash of its scaled coordinates, so at most one of two colliding chunks is cached.
//! Entries are kept on a list ordered by recency, a hit moves an entry one step towards the tail and new entries are appended at the tail.
//!
//! When the byte budget would be exceeded, the cache is pruned from the head with two cursors:
//! the first only evicts entries that were fully read or fully written (or both), the second starts after a preemption weighted number of steps and evicts any unlocked entry.
//!
//! Dirty entries are encoded and written when they are evicted, flushed, or the cache is destroyed.
//! A chunk whose buffer was consumed by a failed encode on eviction is lost, this is reported with a warning.

use std::borrow::Cow;

use h5chunk_grid::{log2_floor, power2up, ArrayIndices};
use serde::{Deserialize, Serialize};

use crate::{
    allocator::file_alloc,
    config::global_config,
    context::ChunkContext,
    fill::FillBuffer,
    filter::FilterMask,
    index::{ChunkIndexTraits, StoredChunk},
    layout::{ChunkLayout, MAX_CHUNK_SIZE},
    ChunkError,
};

/// Chunk cache configuration.
///
/// Setting either the number of slots or the byte budget to zero disables the cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkCacheConfig {
    nslots: usize,
    nbytes: usize,
    w0: f64,
}

impl Default for ChunkCacheConfig {
    /// Create a chunk cache configuration from the global configuration.
    fn default() -> Self {
        let config = global_config();
        Self::new(
            config.chunk_cache_nslots(),
            config.chunk_cache_nbytes(),
            config.chunk_cache_w0(),
        )
    }
}

impl ChunkCacheConfig {
    /// Create a new chunk cache configuration.
    ///
    /// The preemption weight `w0` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(nslots: usize, nbytes: usize, w0: f64) -> Self {
        let (nslots, nbytes) = if nslots == 0 || nbytes == 0 {
            (0, 0)
        } else {
            (nslots, nbytes)
        };
        let w0 = if w0.is_nan() { 0.0 } else { w0.clamp(0.0, 1.0) };
        Self { nslots, nbytes, w0 }
    }

    /// A disabled chunk cache.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, 0, 0.0)
    }

    /// The number of hash slots.
    #[must_use]
    pub const fn nslots(&self) -> usize {
        self.nslots
    }

    /// The byte budget.
    #[must_use]
    pub const fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// The preemption weight.
    #[must_use]
    pub const fn w0(&self) -> f64 {
        self.w0
    }

    /// Returns true if chunks can be cached.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.nslots > 0
    }
}

/// Chunk cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Chunks found in the cache, or created without reading because they are about to be overwritten.
    pub hits: u64,
    /// Chunks read from the file.
    pub misses: u64,
    /// Chunks initialised because they were never written.
    pub inits: u64,
    /// Chunks written to the file.
    pub flushes: u64,
    /// Entries evicted from the cache.
    pub evictions: u64,
}

/// Whether the filter pipeline applies to a cached partial edge chunk.
///
/// A partial edge chunk of a layout that does not filter partial edge chunks is stored unfiltered.
/// When a dataset shrinks so that a formerly complete chunk becomes a partial edge chunk, it is *newly* disabled: it is still stored filtered and must be rewritten unfiltered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EdgeFilterState {
    /// The filter pipeline applies.
    #[default]
    Filtered,
    /// The filter pipeline does not apply.
    Disabled,
    /// The filter pipeline no longer applies, but the stored chunk is still filtered.
    NewlyDisabled,
}

impl EdgeFilterState {
    /// The state of a chunk that is locked again.
    ///
    /// `new_unfilt` is set when the chunk has just become a partial edge chunk, `prev_unfilt` when it has just stopped being one.
    #[must_use]
    pub const fn transition(self, new_unfilt: bool, prev_unfilt: bool) -> Self {
        if new_unfilt {
            Self::NewlyDisabled
        } else if prev_unfilt {
            Self::Filtered
        } else {
            self
        }
    }

    /// Returns true if the filter pipeline is not applied when the chunk is written.
    #[must_use]
    pub const fn filters_disabled(self) -> bool {
        !matches!(self, Self::Filtered)
    }
}

#[derive(Debug)]
struct CacheEntry {
    scaled: ArrayIndices,
    stored: Option<StoredChunk>,
    buf: Vec<u8>,
    dirty: bool,
    locked: bool,
    rd_count: u64,
    wr_count: u64,
    edge: EdgeFilterState,
    prev: Option<usize>,
    next: Option<usize>,
    slot: usize,
}

/// The result of looking up a chunk.
#[derive(Debug, Clone)]
pub(crate) struct ChunkLookup {
    pub(crate) scaled: ArrayIndices,
    pub(crate) stored: Option<StoredChunk>,
    /// The cache slot holding the chunk, if it is cached.
    pub(crate) hint: Option<usize>,
    /// The chunk has just become a partial edge chunk of a layout that does not filter partial edge chunks.
    pub(crate) new_unfilt: bool,
}

impl ChunkLookup {
    pub(crate) fn is_defined(&self) -> bool {
        self.stored.is_some()
    }
}

/// A chunk locked for access.
#[derive(Debug)]
pub(crate) enum LockedChunk {
    Cached(usize),
    Uncached(UncachedChunk),
}

#[derive(Debug)]
pub(crate) struct UncachedChunk {
    scaled: ArrayIndices,
    stored: Option<StoredChunk>,
    buf: Vec<u8>,
    edge: EdgeFilterState,
}

#[derive(Debug, Clone)]
struct LastLookup {
    scaled: ArrayIndices,
    stored: Option<StoredChunk>,
}

/// The raw data chunk cache of a dataset.
#[derive(Debug)]
pub struct ChunkCache {
    config: ChunkCacheConfig,
    slots: Vec<Option<usize>>,
    entries: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    nused: usize,
    nbytes_used: usize,
    scaled_dims: Vec<u64>,
    scaled_encode_bits: Vec<u32>,
    last: Option<LastLookup>,
    stats: CacheStats,
}

impl ChunkCache {
    /// Create an empty chunk cache for chunks of `layout`.
    #[must_use]
    pub fn new(config: ChunkCacheConfig, layout: &ChunkLayout) -> Self {
        let mut cache = Self {
            config,
            slots: vec![None; config.nslots()],
            entries: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            nused: 0,
            nbytes_used: 0,
            scaled_dims: Vec::new(),
            scaled_encode_bits: Vec::new(),
            last: None,
            stats: CacheStats::default(),
        };
        cache.set_geometry(layout);
        cache
    }

    /// Return the cache configuration.
    #[must_use]
    pub const fn config(&self) -> &ChunkCacheConfig {
        &self.config
    }

    /// Return the cache statistics.
    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Return the number of cached chunks.
    #[must_use]
    pub const fn nused(&self) -> usize {
        self.nused
    }

    /// Return the number of bytes of cached chunks.
    #[must_use]
    pub const fn nbytes_used(&self) -> usize {
        self.nbytes_used
    }

    /// Return the scaled coordinates of the cached chunks from least to most recently used.
    #[must_use]
    pub fn chunks(&self) -> Vec<ArrayIndices> {
        self.list()
            .into_iter()
            .filter_map(|id| self.entry(id).map(|entry| entry.scaled.clone()))
            .collect()
    }

    /// Returns true if chunk `scaled` is cached and dirty.
    #[must_use]
    pub fn is_dirty(&self, scaled: &[u64]) -> bool {
        self.find(scaled)
            .and_then(|id| self.entry(id))
            .is_some_and(|entry| entry.dirty)
    }

    fn entry(&self, id: usize) -> Option<&CacheEntry> {
        self.entries.get(id).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, id: usize) -> Option<&mut CacheEntry> {
        self.entries.get_mut(id).and_then(Option::as_mut)
    }

    fn entry_or_err(&mut self, id: usize) -> Result<&mut CacheEntry, ChunkError> {
        self.entry_mut(id)
            .ok_or_else(|| ChunkError::InvalidState(format!("no chunk cache entry {id}")))
    }

    fn list(&self) -> Vec<usize> {
        let mut ids = Vec::with_capacity(self.nused);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.entry(id).and_then(|entry| entry.next);
        }
        ids
    }

    fn set_geometry(&mut self, layout: &ChunkLayout) {
        self.scaled_dims = layout
            .dims()
            .iter()
            .zip(layout.chunk_shape())
            .map(|(&dim, &chunk)| dim / chunk)
            .collect();
        self.scaled_encode_bits = if self.scaled_dims.len() > 1 {
            self.scaled_dims
                .iter()
                .map(|&dim| log2_floor(power2up(dim)))
                .collect()
        } else {
            vec![0; self.scaled_dims.len()]
        };
    }

    /// The hash slot of chunk `scaled`.
    ///
    /// If the chunk grid is small enough along the last dimension, the coordinates are packed into one value with each dimension taking as many bits as its extent needs.
    /// Otherwise the slot is the last coordinate modulo the number of slots.
    fn hash(&self, scaled: &[u64]) -> usize {
        let nslots = self.slots.len() as u64;
        let Some(&last) = scaled.last() else {
            return 0;
        };
        let ndims = scaled.len();
        let value = if ndims > 1
            && self
                .scaled_dims
                .get(ndims - 1)
                .is_some_and(|&dim| dim <= nslots)
        {
            scaled
                .iter()
                .zip(&self.scaled_encode_bits)
                .skip(1)
                .fold(scaled[0], |value, (&s, &bits)| (value << bits) ^ s)
        } else {
            last
        };
        usize::try_from(value % nslots).unwrap_or_default()
    }

    fn find(&self, scaled: &[u64]) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        self.slots[self.hash(scaled)]
            .filter(|&id| self.entry(id).is_some_and(|entry| entry.scaled == scaled))
    }

    /// Remember the storage of chunk `scaled` for the next lookup.
    pub(crate) fn update_last(
        &mut self,
        ctx: &ChunkContext<'_>,
        scaled: &[u64],
        stored: Option<StoredChunk>,
    ) {
        if ctx.is_parallel_write() && !ctx.pipeline.is_empty() {
            return;
        }
        self.last = Some(LastLookup {
            scaled: scaled.to_vec(),
            stored,
        });
    }

    /// Forget the last index lookup.
    pub(crate) fn reset_last(&mut self) {
        self.last = None;
    }

    /// Find the storage of chunk `scaled`.
    ///
    /// The cache is consulted first, then the last index lookup, then the index.
    pub(crate) fn lookup(
        &mut self,
        ctx: &ChunkContext<'_>,
        scaled: &[u64],
    ) -> Result<ChunkLookup, ChunkError> {
        if !self.slots.is_empty() {
            let slot = self.hash(scaled);
            if let Some(entry) = self.slots[slot].and_then(|id| self.entry(id)) {
                if entry.scaled == scaled {
                    return Ok(ChunkLookup {
                        scaled: scaled.to_vec(),
                        stored: entry.stored,
                        hint: Some(slot),
                        new_unfilt: false,
                    });
                }
            }
        }

        let stored = match &self.last {
            Some(last) if last.scaled == scaled => last.stored,
            _ => {
                let stored = ctx.index.get_addr(&ctx.info(), scaled)?;
                self.update_last(ctx, scaled, stored);
                stored
            }
        };
        Ok(ChunkLookup {
            scaled: scaled.to_vec(),
            stored,
            hint: None,
            new_unfilt: false,
        })
    }

    /// Returns true if a chunk may pass through the cache.
    ///
    /// Filtered chunks always do.
    /// Unfiltered chunks are not cached when writing in parallel, and chunks larger than the cache only pass through it when they are written for the first time and must be filled.
    pub(crate) fn cacheable(&self, ctx: &ChunkContext<'_>, lookup: &ChunkLookup, write: bool) -> bool {
        if ctx.is_filtered(&lookup.scaled) {
            true
        } else if ctx.is_parallel_write() {
            false
        } else if ctx.layout.size_usize() > self.config.nbytes() {
            write && !lookup.is_defined() && ctx.fill.fill_on_create()
        } else {
            true
        }
    }

    /// Move entry `id` to the most recently used end of the list.
    fn promote(&mut self, id: usize) {
        let Some((prev, next)) = self.entry(id).map(|entry| (entry.prev, entry.next)) else {
            return;
        };
        let Some(next) = next else {
            return;
        };
        match prev {
            Some(prev) => {
                if let Some(entry) = self.entry_mut(prev) {
                    entry.next = Some(next);
                }
            }
            None => self.head = Some(next),
        }
        if let Some(entry) = self.entry_mut(next) {
            entry.prev = prev;
        }
        let tail = self.tail;
        if let Some(entry) = tail.and_then(|tail| self.entry_mut(tail)) {
            entry.next = Some(id);
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.prev = tail;
            entry.next = None;
        }
        self.tail = Some(id);
    }

    fn push_tail(&mut self, mut entry: CacheEntry) -> usize {
        entry.prev = self.tail;
        entry.next = None;
        let id = if let Some(id) = self.free.pop() {
            self.entries[id] = Some(entry);
            id
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        };
        match self.tail {
            Some(tail) => {
                if let Some(entry) = self.entry_mut(tail) {
                    entry.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    fn unlink(&mut self, id: usize) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(id)?.take()?;
        match entry.prev {
            Some(prev) => {
                if let Some(prev) = self.entry_mut(prev) {
                    prev.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(next) = self.entry_mut(next) {
                    next.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }
        if self.slots.get(entry.slot) == Some(&Some(id)) {
            self.slots[entry.slot] = None;
        }
        self.free.push(id);
        self.nused -= 1;
        self.nbytes_used -= entry.buf.len();
        Some(entry)
    }

    /// Lock chunk `lookup.scaled` for access, reading or initialising it as needed.
    ///
    /// With `relax` the chunk is about to be overwritten entirely, so it is neither read nor filled.
    /// `prev_unfilt` is set when the chunk has just stopped being an unfiltered partial edge chunk.
    pub(crate) fn lock(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        lookup: &ChunkLookup,
        relax: bool,
        prev_unfilt: bool,
    ) -> Result<LockedChunk, ChunkError> {
        let has_filters = !ctx.pipeline.is_empty();
        let cached = lookup
            .hint
            .and_then(|slot| self.slots.get(slot).copied().flatten())
            .filter(|&id| self.entry(id).is_some_and(|entry| entry.scaled == lookup.scaled));
        if let Some(id) = cached {
            let entry = self.entry_or_err(id)?;
            if entry.locked {
                return Err(ChunkError::InvalidState(format!(
                    "chunk {:?} is already locked",
                    lookup.scaled
                )));
            }
            if has_filters {
                entry.edge = entry.edge.transition(lookup.new_unfilt, prev_unfilt);
            }
            entry.locked = true;
            self.stats.hits += 1;
            self.promote(id);
            return Ok(LockedChunk::Cached(id));
        }

        let chunk_size = ctx.layout.size_usize();
        let mut edge = EdgeFilterState::Filtered;
        let mut read_filtered = has_filters;
        if has_filters {
            if lookup.new_unfilt {
                edge = EdgeFilterState::NewlyDisabled;
            } else if prev_unfilt {
                read_filtered = false;
            } else if ctx.layout.is_unfiltered_edge_chunk(&lookup.scaled) {
                edge = EdgeFilterState::Disabled;
                read_filtered = false;
            }
        }

        let buf = if relax {
            self.stats.hits += 1;
            vec![0; chunk_size]
        } else if let Some(stored) = lookup.stored {
            let raw = ctx.file.read(stored.region())?.to_vec();
            let buf = if read_filtered {
                ctx.pipeline.reverse(raw, stored.filter_mask, &ctx.options)?
            } else {
                raw
            };
            if buf.len() != chunk_size {
                return Err(ChunkError::LookupError(format!(
                    "chunk {:?} decoded to {} bytes, expected {chunk_size}",
                    lookup.scaled,
                    buf.len()
                )));
            }
            self.stats.misses += 1;
            buf
        } else {
            self.stats.inits += 1;
            if ctx.fill.fill_on_create() {
                let element_size = usize::try_from(ctx.layout.element_size()).unwrap_or(1);
                FillBuffer::new(ctx.fill, element_size).chunk(chunk_size)
            } else {
                vec![0; chunk_size]
            }
        };

        if self.config.is_enabled() && chunk_size <= self.config.nbytes() {
            let slot = self.hash(&lookup.scaled);
            let occupant = self.slots[slot];
            if !occupant.and_then(|id| self.entry(id)).is_some_and(|entry| entry.locked) {
                if let Some(occupant) = occupant {
                    self.evict(ctx, occupant, true)?;
                }
                self.prune(ctx, chunk_size)?;
                let size = chunk_size as u64;
                let id = self.push_tail(CacheEntry {
                    scaled: lookup.scaled.clone(),
                    stored: lookup.stored,
                    buf,
                    dirty: false,
                    locked: true,
                    rd_count: size,
                    wr_count: size,
                    edge,
                    prev: None,
                    next: None,
                    slot,
                });
                self.slots[slot] = Some(id);
                self.nused += 1;
                self.nbytes_used += chunk_size;
                return Ok(LockedChunk::Cached(id));
            }
        }

        Ok(LockedChunk::Uncached(UncachedChunk {
            scaled: lookup.scaled.clone(),
            stored: lookup.stored,
            buf,
            edge,
        }))
    }

    /// Return the buffer of a locked chunk.
    pub(crate) fn chunk<'a>(&'a self, locked: &'a LockedChunk) -> Result<&'a [u8], ChunkError> {
        match locked {
            LockedChunk::Cached(id) => self
                .entry(*id)
                .map(|entry| entry.buf.as_slice())
                .ok_or_else(|| ChunkError::InvalidState(format!("no chunk cache entry {id}"))),
            LockedChunk::Uncached(chunk) => Ok(&chunk.buf),
        }
    }

    /// Return the mutable buffer of a locked chunk.
    pub(crate) fn chunk_mut<'a>(
        &'a mut self,
        locked: &'a mut LockedChunk,
    ) -> Result<&'a mut [u8], ChunkError> {
        match locked {
            LockedChunk::Cached(id) => Ok(self.entry_or_err(*id)?.buf.as_mut_slice()),
            LockedChunk::Uncached(chunk) => Ok(&mut chunk.buf),
        }
    }

    /// Unlock a chunk.
    ///
    /// `naccessed` is the number of bytes of the chunk that were read, or written if `dirty`.
    /// A dirty chunk that is not cached is written immediately.
    pub(crate) fn unlock(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        locked: LockedChunk,
        dirty: bool,
        naccessed: u64,
    ) -> Result<(), ChunkError> {
        match locked {
            LockedChunk::Cached(id) => {
                let entry = self.entry_or_err(id)?;
                if dirty {
                    entry.dirty = true;
                    entry.wr_count -= std::cmp::min(entry.wr_count, naccessed);
                } else {
                    entry.rd_count -= std::cmp::min(entry.rd_count, naccessed);
                }
                entry.locked = false;
                Ok(())
            }
            LockedChunk::Uncached(chunk) => {
                if !dirty {
                    return Ok(());
                }
                let mut entry = CacheEntry {
                    slot: 0,
                    rd_count: 0,
                    wr_count: 0,
                    prev: None,
                    next: None,
                    locked: false,
                    dirty: true,
                    scaled: chunk.scaled,
                    stored: chunk.stored,
                    buf: chunk.buf,
                    edge: chunk.edge,
                };
                self.flush_entry(ctx, &mut entry, true)
            }
        }
    }

    /// Encode and write a dirty entry.
    ///
    /// With `reset` the buffer is consumed.
    fn flush_entry(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        entry: &mut CacheEntry,
        reset: bool,
    ) -> Result<(), ChunkError> {
        if !entry.dirty {
            if reset {
                entry.buf = Vec::new();
            }
            return Ok(());
        }
        let point_of_no_return = reset && ctx.is_filtered(&entry.scaled) && !entry.edge.filters_disabled();
        let result = self.write_entry(ctx, entry, reset);
        if reset {
            entry.buf = Vec::new();
        }
        if let Err(err) = &result {
            if point_of_no_return {
                log::warn!(
                    "chunk {:?} lost after a failed flush: {err}",
                    entry.scaled
                );
            }
        }
        result
    }

    fn write_entry(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        entry: &mut CacheEntry,
        reset: bool,
    ) -> Result<(), ChunkError> {
        let mut length = ctx.layout.size();
        let mut filter_mask = FilterMask::NONE;
        let mut must_alloc = false;
        let data: Cow<'_, [u8]> = if !ctx.pipeline.is_empty() && !entry.edge.filters_disabled() {
            let buf = if reset {
                std::mem::take(&mut entry.buf)
            } else {
                entry.buf.clone()
            };
            let (encoded, mask) = ctx.pipeline.apply(buf, &ctx.options)?;
            length = encoded.len() as u64;
            if length > MAX_CHUNK_SIZE {
                return Err(ChunkError::EncodingOverflow {
                    length,
                    needed: (log2_floor(length) + 8) / 8,
                    allowed: 4,
                });
            }
            filter_mask = mask;
            must_alloc = true;
            Cow::Owned(encoded)
        } else {
            if entry.stored.is_none() || entry.edge == EdgeFilterState::NewlyDisabled {
                must_alloc = true;
                if entry.edge == EdgeFilterState::NewlyDisabled {
                    entry.edge = EdgeFilterState::Disabled;
                }
            }
            Cow::Borrowed(entry.buf.as_slice())
        };

        let (offset, need_insert) = if must_alloc {
            let (offset, need_insert) = file_alloc(ctx, entry.stored, length, &entry.scaled)?;
            (offset, need_insert || entry.stored.is_some_and(|old| old.filter_mask != filter_mask))
        } else {
            match entry.stored {
                Some(stored) => (stored.offset, false),
                None => {
                    return Err(ChunkError::InvalidState(format!(
                        "chunk {:?} has no storage",
                        entry.scaled
                    )))
                }
            }
        };
        ctx.file.write(offset, &data)?;
        drop(data);

        let stored = StoredChunk {
            offset,
            length,
            filter_mask,
        };
        if need_insert {
            let info = ctx.info();
            ctx.index.insert(&info, &entry.scaled, stored)?;
        }
        entry.stored = Some(stored);
        let scaled = entry.scaled.clone();
        self.update_last(ctx, &scaled, Some(stored));
        entry.dirty = false;
        self.stats.flushes += 1;
        log::trace!("flushed chunk {scaled:?} to {}", stored.region());
        Ok(())
    }

    /// Remove entry `id` from the cache, writing it first if `flush` and it is dirty.
    ///
    /// The entry is removed even if writing it fails.
    fn evict(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        id: usize,
        flush: bool,
    ) -> Result<(), ChunkError> {
        if self.entry(id).is_some_and(|entry| entry.locked) {
            return Err(ChunkError::InvalidState(format!(
                "chunk cache entry {id} is locked"
            )));
        }
        let Some(mut entry) = self.unlink(id) else {
            return Ok(());
        };
        self.stats.evictions += 1;
        if flush {
            self.flush_entry(ctx, &mut entry, true)
        } else {
            Ok(())
        }
    }

    /// Evict entries until `size` more bytes fit the byte budget.
    fn prune(&mut self, ctx: &mut ChunkContext<'_>, size: usize) -> Result<(), ChunkError> {
        let total = self.config.nbytes();
        let chunk_size = ctx.layout.size();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mut w0 = (self.nused as f64 * self.config.w0()) as i64;
        let mut p: [Option<usize>; 2] = [self.head, None];
        let mut n: [Option<usize>; 2] = [None, None];
        let mut second_pass = false;
        let mut result = Ok(());

        while self.nbytes_used + size > total {
            // the second pass starts once the first has examined its share or run off the list
            if !second_pass && (w0 <= 0 || p[0].is_none()) {
                p[1] = self.head;
                second_pass = true;
            }
            if p[0].is_none() && p[1].is_none() {
                break;
            }
            for i in 0..2 {
                n[i] = p[i].and_then(|id| self.entry(id)).and_then(|entry| entry.next);
            }
            for i in 0..2 {
                if self.nbytes_used + size <= total {
                    break;
                }
                let candidate = p[i].filter(|&id| {
                    self.entry(id).is_some_and(|entry| {
                        !entry.locked
                            && (i == 1
                                || (entry.rd_count == 0 && entry.wr_count == 0)
                                || (entry.rd_count == 0 && entry.wr_count == chunk_size)
                                || (entry.rd_count == chunk_size && entry.wr_count == 0))
                    })
                });
                if let Some(cur) = candidate {
                    let next = self.entry(cur).and_then(|entry| entry.next);
                    for j in 0..2 {
                        if p[j] == Some(cur) {
                            p[j] = None;
                        }
                        if n[j] == Some(cur) {
                            n[j] = next;
                        }
                    }
                    if let Err(err) = self.evict(ctx, cur, true) {
                        log::warn!("unable to flush a chunk while pruning the chunk cache: {err}");
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
            }
            p = n;
            w0 -= 1;
        }
        result
    }

    /// Write every dirty entry.
    pub(crate) fn flush(&mut self, ctx: &mut ChunkContext<'_>) -> Result<(), ChunkError> {
        let mut result = Ok(());
        for id in self.list() {
            let Some(mut entry) = self.entries.get_mut(id).and_then(Option::take) else {
                continue;
            };
            let flushed = self.flush_entry(ctx, &mut entry, false);
            self.entries[id] = Some(entry);
            if let Err(err) = flushed {
                log::warn!("unable to flush a chunk: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Write chunk `scaled` if it is cached and dirty.
    pub(crate) fn flush_chunk(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        scaled: &[u64],
    ) -> Result<(), ChunkError> {
        let Some(id) = self.find(scaled) else {
            return Ok(());
        };
        let Some(mut entry) = self.entries.get_mut(id).and_then(Option::take) else {
            return Ok(());
        };
        let result = self.flush_entry(ctx, &mut entry, false);
        self.entries[id] = Some(entry);
        result
    }

    /// Evict chunk `scaled` if it is cached, writing it first if `flush`.
    pub(crate) fn evict_chunk(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        scaled: &[u64],
        flush: bool,
    ) -> Result<(), ChunkError> {
        match self.find(scaled) {
            Some(id) => self.evict(ctx, id, flush),
            None => Ok(()),
        }
    }

    /// Write and evict every entry.
    pub(crate) fn dest(&mut self, ctx: &mut ChunkContext<'_>) -> Result<(), ChunkError> {
        let mut result = Ok(());
        for id in self.list() {
            if let Err(err) = self.evict(ctx, id, true) {
                log::warn!("unable to flush a chunk while destroying the chunk cache: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.reset_last();
        result
    }

    /// Evict every entry without writing it.
    pub(crate) fn discard(&mut self, ctx: &mut ChunkContext<'_>) -> Result<(), ChunkError> {
        for id in self.list() {
            self.evict(ctx, id, false)?;
        }
        self.reset_last();
        Ok(())
    }

    /// Rehash the cache after the dimensions of the dataset changed.
    ///
    /// When two entries hash to the same slot the more recently used one keeps it, the other is written and evicted.
    pub(crate) fn update(&mut self, ctx: &mut ChunkContext<'_>) -> Result<(), ChunkError> {
        self.set_geometry(ctx.layout);
        self.reset_last();
        if self.slots.is_empty() {
            return Ok(());
        }
        let ids = self.list();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        let mut displaced = Vec::new();
        for id in ids {
            let Some(scaled) = self.entry(id).map(|entry| entry.scaled.clone()) else {
                continue;
            };
            let slot = self.hash(&scaled);
            if let Some(old) = self.slots[slot].replace(id) {
                displaced.push(old);
            }
            if let Some(entry) = self.entry_mut(id) {
                entry.slot = slot;
            }
        }
        let mut result = Ok(());
        for id in displaced {
            if let Err(err) = self.evict(ctx, id, true) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

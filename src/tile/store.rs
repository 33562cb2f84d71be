//! Shared cache of decoded tiles.
//!
//! # Tiers
//!
//! - **Memory**: an LRU bounded by tile count and bytes.
//! - **Overflow** (optional): tiles evicted from memory spill to disk and
//!   are promoted back on the next hit.
//!
//! # Single-flight
//!
//! Concurrent requests for the same missing tile decode it once. The first
//! requester becomes the leader and decodes; later requesters wait for the
//! leader's result, success or failure. A leader that was cancelled hands
//! its waiters nothing: they retry and one of them leads the next attempt.
//! A cancelled or failed decode never inserts anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CodecError;
use crate::export::CancelFlag;

use super::overflow::{OverflowArea, OverflowConfig};
use super::raster::RasterTile;

/// Default memory tier: 4096 tiles
pub const DEFAULT_MAX_TILES: usize = 4096;

/// Default memory tier: 256MB
pub const DEFAULT_MAX_BYTES: usize = 256 * 1024 * 1024;

/// Identity of an open image, unique per process.
pub type ImageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub image: ImageId,
    pub tile_x: u32,
    pub tile_y: u32,
}

impl TileKey {
    pub fn new(image: ImageId, tile_x: u32, tile_y: u32) -> Self {
        Self {
            image,
            tile_x,
            tile_y,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileStoreConfig {
    pub max_tiles: usize,
    pub max_bytes: usize,
    pub overflow: Option<OverflowConfig>,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            max_tiles: DEFAULT_MAX_TILES,
            max_bytes: DEFAULT_MAX_BYTES,
            overflow: None,
        }
    }
}

/// Counters since the store was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TileStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub decodes: u64,
    pub spills: u64,
    pub overflow_hits: u64,
    pub spilled_bytes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    decodes: AtomicU64,
    spills: AtomicU64,
    overflow_hits: AtomicU64,
}

// =============================================================================
// In-flight Decodes
// =============================================================================

type FlightResult = Result<Arc<RasterTile>, CodecError>;

/// One decode in progress. Waiters block on `ready` until `result` is set.
#[derive(Default)]
struct Flight {
    result: Mutex<Option<FlightResult>>,
    ready: Condvar,
}

impl Flight {
    fn complete(&self, result: FlightResult) {
        *lock(&self.result) = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> FlightResult {
        let mut guard = lock(&self.result);
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

enum Role {
    Cached(Arc<RasterTile>),
    Leader(Arc<Flight>),
    Waiter(Arc<Flight>),
}

/// The leader's side of a flight. Dropped unpublished, as when the decode
/// panics, it fails the flight so waiters are never left blocked.
struct Lead<'a> {
    store: &'a TileStore,
    key: TileKey,
    flight: Arc<Flight>,
    published: bool,
}

impl Lead<'_> {
    fn publish(mut self, result: FlightResult) {
        self.published = true;
        self.store.publish(self.key, &self.flight, result);
    }
}

impl Drop for Lead<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        warn!(
            image = self.key.image,
            x = self.key.tile_x,
            y = self.key.tile_y,
            "tile decode abandoned"
        );
        self.store.publish(
            self.key,
            &self.flight,
            Err(CodecError::Worker("tile decode panicked".into())),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// TileStore
// =============================================================================

struct MemoryTier {
    tiles: LruCache<TileKey, Arc<RasterTile>>,
    bytes: usize,
}

/// Two-tier tile cache with single-flight decoding.
///
/// # Thread Safety
///
/// Shared via `Arc` between images and threads. Lock order is memory, then
/// in-flight; the overflow lock is never held together with either.
pub struct TileStore {
    memory: Mutex<MemoryTier>,
    in_flight: Mutex<HashMap<TileKey, Arc<Flight>>>,
    overflow: Option<Mutex<OverflowArea>>,
    max_tiles: usize,
    max_bytes: usize,
    counters: Counters,
}

impl TileStore {
    /// # Errors
    /// Fails only if the overflow directory cannot be created.
    pub fn new(config: TileStoreConfig) -> Result<Self, CodecError> {
        let overflow = config
            .overflow
            .as_ref()
            .map(OverflowArea::new)
            .transpose()?
            .map(Mutex::new);
        Ok(Self {
            memory: Mutex::new(MemoryTier {
                tiles: LruCache::unbounded(),
                bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            overflow,
            max_tiles: config.max_tiles.max(1),
            max_bytes: config.max_bytes,
            counters: Counters::default(),
        })
    }

    /// Memory-only store with default bounds.
    pub fn in_memory() -> Self {
        Self {
            memory: Mutex::new(MemoryTier {
                tiles: LruCache::unbounded(),
                bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            overflow: None,
            max_tiles: DEFAULT_MAX_TILES,
            max_bytes: DEFAULT_MAX_BYTES,
            counters: Counters::default(),
        }
    }

    /// Return the cached tile for `key`, decoding it with `decode` on a miss.
    ///
    /// `decode` runs at most once per call, and only on the thread that
    /// leads the decode of `key`. Cancellation is checked before it runs.
    ///
    /// # Errors
    /// `Cancelled` if `cancel` is set before the decode, otherwise whatever
    /// the leading decode returned.
    pub fn get_or_decode<F>(
        &self,
        key: TileKey,
        cancel: &CancelFlag,
        decode: F,
    ) -> Result<Arc<RasterTile>, CodecError>
    where
        F: FnOnce() -> Result<RasterTile, CodecError>,
    {
        let flight = loop {
            if let Some(tile) = self.memory_hit(&key) {
                return Ok(tile);
            }
            match self.join_or_lead(key) {
                Role::Cached(tile) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(tile);
                }
                Role::Leader(flight) => break flight,
                Role::Waiter(flight) => match flight.wait() {
                    Err(CodecError::Cancelled) => {
                        cancel.check()?;
                        continue;
                    }
                    Ok(tile) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(tile);
                    }
                    Err(e) => return Err(e),
                },
            }
        };
        let lead = Lead {
            store: self,
            key,
            flight,
            published: false,
        };

        // Promotion runs as the leader so no other thread can decode the
        // tile while it is between tiers.
        if let Some(tile) = self.take_spilled(&key) {
            lead.publish(Ok(tile.clone()));
            return Ok(tile);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let result = cancel.check().and_then(|_| {
            self.counters.decodes.fetch_add(1, Ordering::Relaxed);
            debug!(image = key.image, x = key.tile_x, y = key.tile_y, "decoding tile");
            decode()
        });
        let result = result.map(Arc::new);
        lead.publish(result.clone());
        result
    }

    /// Re-checks memory under the same locks the leader publishes with, so
    /// a decode that finished after `memory_hit` is never repeated.
    fn join_or_lead(&self, key: TileKey) -> Role {
        let mut memory = lock(&self.memory);
        if let Some(tile) = memory.tiles.get(&key) {
            return Role::Cached(tile.clone());
        }
        let mut in_flight = lock(&self.in_flight);
        if let Some(flight) = in_flight.get(&key) {
            return Role::Waiter(flight.clone());
        }
        let flight = Arc::new(Flight::default());
        in_flight.insert(key, flight.clone());
        Role::Leader(flight)
    }

    fn memory_hit(&self, key: &TileKey) -> Option<Arc<RasterTile>> {
        let tile = lock(&self.memory).tiles.get(key)?.clone();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(tile)
    }

    /// Remove `key` from the overflow area. Only the leader of `key` calls
    /// this.
    fn take_spilled(&self, key: &TileKey) -> Option<Arc<RasterTile>> {
        let tile = lock(self.overflow.as_ref()?).take(key)?;
        self.counters.overflow_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(image = key.image, x = key.tile_x, y = key.tile_y, "promoted spilled tile");
        Some(Arc::new(tile))
    }

    /// Finish a flight: cache a successful result, retire the in-flight
    /// entry and wake the waiters. Both locks are held so a lookup never
    /// misses a finished tile.
    fn publish(&self, key: TileKey, flight: &Flight, result: FlightResult) {
        let evicted = {
            let mut memory = lock(&self.memory);
            let mut in_flight = lock(&self.in_flight);
            let evicted = match &result {
                Ok(tile) => self.insert_locked(&mut memory, key, tile.clone()),
                Err(_) => Vec::new(),
            };
            in_flight.remove(&key);
            evicted
        };
        flight.complete(result);
        self.spill(evicted);
    }

    /// Insert a tile directly, replacing any previous one.
    pub fn insert(&self, key: TileKey, tile: Arc<RasterTile>) {
        let evicted = {
            let mut memory = lock(&self.memory);
            self.insert_locked(&mut memory, key, tile)
        };
        self.spill(evicted);
    }

    fn insert_locked(
        &self,
        memory: &mut MemoryTier,
        key: TileKey,
        tile: Arc<RasterTile>,
    ) -> Vec<(TileKey, Arc<RasterTile>)> {
        let size = tile.byte_len();
        if let Some(old) = memory.tiles.put(key, tile) {
            memory.bytes = memory.bytes.saturating_sub(old.byte_len());
        }
        memory.bytes += size;

        let mut evicted = Vec::new();
        while memory.tiles.len() > 1
            && (memory.tiles.len() > self.max_tiles || memory.bytes > self.max_bytes)
        {
            let Some((old_key, old)) = memory.tiles.pop_lru() else {
                break;
            };
            memory.bytes = memory.bytes.saturating_sub(old.byte_len());
            evicted.push((old_key, old));
        }
        evicted
    }

    fn spill(&self, evicted: Vec<(TileKey, Arc<RasterTile>)>) {
        let Some(overflow) = &self.overflow else {
            return;
        };
        if evicted.is_empty() {
            return;
        }
        let mut overflow = lock(overflow);
        for (key, tile) in evicted {
            match overflow.put(key, &tile) {
                Ok(true) => {
                    self.counters.spills.fetch_add(1, Ordering::Relaxed);
                    debug!(image = key.image, x = key.tile_x, y = key.tile_y, "spilled tile");
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "cannot spill tile, dropping it"),
            }
        }
    }

    /// Whether `key` is cached in either tier, without touching LRU order.
    pub fn contains(&self, key: &TileKey) -> bool {
        if lock(&self.memory).tiles.contains(key) {
            return true;
        }
        self.overflow
            .as_ref()
            .map_or(false, |o| lock(o).contains(key))
    }

    /// Drop every tile of `image` from both tiers.
    pub fn evict_image(&self, image: ImageId) -> usize {
        let mut removed = {
            let mut memory = lock(&self.memory);
            let keys: Vec<TileKey> = memory
                .tiles
                .iter()
                .map(|(k, _)| *k)
                .filter(|k| k.image == image)
                .collect();
            for key in &keys {
                if let Some(tile) = memory.tiles.pop(key) {
                    memory.bytes = memory.bytes.saturating_sub(tile.byte_len());
                }
            }
            keys.len()
        };
        if let Some(overflow) = &self.overflow {
            removed += lock(overflow).remove_image(image);
        }
        debug!(image, removed, "evicted image tiles");
        removed
    }

    pub fn clear(&self) {
        {
            let mut memory = lock(&self.memory);
            memory.tiles.clear();
            memory.bytes = 0;
        }
        if let Some(overflow) = &self.overflow {
            lock(overflow).clear();
        }
    }

    /// Tiles held in memory.
    pub fn len(&self) -> usize {
        lock(&self.memory).tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held in memory.
    pub fn size(&self) -> usize {
        lock(&self.memory).bytes
    }

    /// Tiles held in the overflow area.
    pub fn spilled_len(&self) -> usize {
        self.overflow.as_ref().map_or(0, |o| lock(o).len())
    }

    pub fn stats(&self) -> TileStoreStats {
        TileStoreStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            decodes: self.counters.decodes.load(Ordering::Relaxed),
            spills: self.counters.spills.load(Ordering::Relaxed),
            overflow_hits: self.counters.overflow_hits.load(Ordering::Relaxed),
            spilled_bytes: self.overflow.as_ref().map_or(0, |o| lock(o).bytes()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

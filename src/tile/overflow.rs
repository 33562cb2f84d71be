//! Disk tier of the tile store.
//!
//! Tiles evicted from memory are written one file per tile. The tier is
//! bounded in bytes and evicts least-recently-spilled first, deleting the
//! file. A hit removes the file: the tile moves back to memory.

use std::fs;
use std::io;
use std::path::PathBuf;

use lru::LruCache;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::CodecError;

use super::raster::RasterTile;
use super::store::{ImageId, TileKey};

/// Where and how much to spill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverflowConfig {
    /// Directory for spilled tiles; a private temporary directory if unset
    pub dir: Option<PathBuf>,

    /// Byte budget of the disk tier
    pub max_bytes: u64,
}

pub(crate) struct OverflowArea {
    dir: PathBuf,

    /// Keeps the private directory alive; removed with it on drop
    _temp: Option<TempDir>,

    entries: LruCache<TileKey, u64>,
    bytes: u64,
    max_bytes: u64,
}

impl OverflowArea {
    pub fn new(config: &OverflowConfig) -> Result<Self, CodecError> {
        let (dir, temp) = match &config.dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("raster-tiles-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        debug!(dir = %dir.display(), max_bytes = config.max_bytes, "tile overflow area ready");
        Ok(Self {
            dir,
            _temp: temp,
            entries: LruCache::unbounded(),
            bytes: 0,
            max_bytes: config.max_bytes,
        })
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains(key)
    }

    fn file_for(&self, key: &TileKey) -> PathBuf {
        self.dir
            .join(format!("{}-{}-{}.tile", key.image, key.tile_x, key.tile_y))
    }

    /// Write `tile` to disk. Returns `false` when it is larger than the
    /// whole tier and was not kept.
    pub fn put(&mut self, key: TileKey, tile: &RasterTile) -> Result<bool, CodecError> {
        let data = tile.to_bytes();
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Ok(false);
        }
        self.remove(&key);
        fs::write(self.file_for(&key), &data)?;
        self.entries.put(key, size);
        self.bytes += size;

        while self.bytes > self.max_bytes {
            let Some((old, old_size)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(old_size);
            self.delete_file(&old);
            debug!(image = old.image, x = old.tile_x, y = old.tile_y, "dropped spilled tile");
        }
        Ok(true)
    }

    /// Read back and forget a spilled tile.
    ///
    /// A file that cannot be read or parsed is dropped and reported as a
    /// miss; the tile is simply decoded again.
    pub fn take(&mut self, key: &TileKey) -> Option<RasterTile> {
        let size = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(size);
        let path = self.file_for(key);
        let tile = fs::read(&path)
            .map_err(CodecError::from)
            .and_then(|data| RasterTile::from_bytes(&data).map_err(CodecError::from));
        self.delete_file(key);
        match tile {
            Ok(tile) => Some(tile),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable spilled tile");
                None
            }
        }
    }

    pub fn remove(&mut self, key: &TileKey) -> bool {
        match self.entries.pop(key) {
            Some(size) => {
                self.bytes = self.bytes.saturating_sub(size);
                self.delete_file(key);
                true
            }
            None => false,
        }
    }

    pub fn remove_image(&mut self, image: ImageId) -> usize {
        let keys: Vec<TileKey> = self
            .entries
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| k.image == image)
            .collect();
        keys.iter().filter(|k| self.remove(k)).count()
    }

    pub fn clear(&mut self) {
        let keys: Vec<TileKey> = self.entries.iter().map(|(k, _)| *k).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    fn delete_file(&self, key: &TileKey) {
        match fs::remove_file(self.file_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "cannot delete spilled tile"),
        }
    }
}

impl Drop for OverflowArea {
    fn drop(&mut self) {
        // A configured directory outlives the store; leave it empty.
        if self._temp.is_none() {
            self.clear();
        }
    }
}

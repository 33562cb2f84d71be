//! The logical image handed to consumers.
//!
//! A [`RasterImage`] pairs a [`TileSource`] with a shared [`TileStore`].
//! Tiles are fetched through the store, so repeated access (scrolling,
//! zooming, exporting) decodes each tile once while it stays cached.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::FormatDescriptor;
use crate::error::{CodecError, FormatError};
use crate::export::CancelFlag;
use crate::tile::{
    ImageId, MemoryTileSource, RasterTile, SampleType, Samples, TileKey, TileSource, TileStore,
};

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

/// A decoded (or decodable) image addressed by tiles.
///
/// Cheap to share by reference across threads: concurrent `tile` calls for
/// the same cell decode it once.
pub struct RasterImage {
    id: ImageId,
    source: Box<dyn TileSource>,
    store: Arc<TileStore>,
    closed: AtomicBool,
}

impl RasterImage {
    pub fn new(source: Box<dyn TileSource>, store: Arc<TileStore>) -> Self {
        let id = NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed);
        let d = source.descriptor();
        debug!(
            image = id,
            width = d.width,
            height = d.height,
            bands = d.bands,
            bits = d.bits_per_sample,
            "raster image opened"
        );
        Self {
            id,
            source,
            store,
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap a raster held in memory. `samples` are interleaved colour bands,
    /// row-major, covering the whole image.
    ///
    /// # Errors
    /// `ShortRead` if `samples` does not match the descriptor.
    pub fn from_samples(
        descriptor: FormatDescriptor,
        samples: Samples,
        store: Arc<TileStore>,
    ) -> Result<Self, CodecError> {
        let source = MemoryTileSource::new(descriptor, samples)?;
        Ok(Self::new(Box::new(source), store))
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn descriptor(&self) -> &FormatDescriptor {
        self.source.descriptor()
    }

    pub fn width(&self) -> u32 {
        self.descriptor().width
    }

    pub fn height(&self) -> u32 {
        self.descriptor().height
    }

    pub fn bands(&self) -> u16 {
        self.descriptor().bands
    }

    pub fn sample_type(&self) -> SampleType {
        SampleType::for_bits(self.descriptor().bits_per_sample)
    }

    pub fn tiles_across(&self) -> u32 {
        self.descriptor().tiles_across()
    }

    pub fn tiles_down(&self) -> u32 {
        self.descriptor().tiles_down()
    }

    /// Source file, if the image was decoded from one.
    pub fn path(&self) -> Option<&Path> {
        self.source.path()
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    /// Fetch one tile, decoding it on a cache miss.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` is set before the decode starts; nothing is
    ///   cached in that case
    /// - `UnsupportedLayout` for a cell outside the tile grid
    /// - any decode failure of the source
    pub fn tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<Arc<RasterTile>, CodecError> {
        let key = TileKey::new(self.id, tile_x, tile_y);
        self.store
            .get_or_decode(key, cancel, || self.source.decode_tile(tile_x, tile_y, cancel))
    }

    /// Copy the pixel rectangle `(x, y, width, height)` out of the tiles
    /// covering it.
    ///
    /// # Errors
    /// `UnsupportedLayout` if the rectangle leaves the image, otherwise as
    /// [`tile`](Self::tile).
    pub fn read_rect(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        cancel: &CancelFlag,
    ) -> Result<Samples, CodecError> {
        let d = self.descriptor();
        let fits = x.checked_add(width).map_or(false, |r| r <= d.width)
            && y.checked_add(height).map_or(false, |b| b <= d.height);
        if !fits || width == 0 || height == 0 {
            return Err(FormatError::UnsupportedLayout(format!(
                "rectangle {}x{}+{}+{} outside {}x{} image",
                width, height, x, y, d.width, d.height
            ))
            .into());
        }

        let bands = d.bands as usize;
        let len = width as usize * height as usize * bands;
        let mut out = match self.sample_type() {
            SampleType::U8 => Samples::U8(vec![0; len]),
            SampleType::U16 => Samples::U16(vec![0; len]),
        };

        let (tw, th) = (d.tile_width, d.tile_height);
        for ty in y / th..=(y + height - 1) / th {
            for tx in x / tw..=(x + width - 1) / tw {
                let tile = self.tile(tx, ty, cancel)?;
                let overlap = Overlap {
                    rect: (x, y, width, height),
                    tile_origin: (tx * tw, ty * th),
                    tile_width: tile.width,
                    tile_height: tile.height,
                    bands,
                };
                match (&mut out, &tile.samples) {
                    (Samples::U8(dst), Samples::U8(src)) => overlap.copy(src, dst),
                    (Samples::U16(dst), Samples::U16(src)) => overlap.copy(src, dst),
                    _ => {
                        return Err(FormatError::UnsupportedLayout(
                            "tile sample type differs from image".into(),
                        )
                        .into())
                    }
                }
            }
        }
        Ok(out)
    }

    /// The whole image as one interleaved buffer.
    pub fn to_samples(&self, cancel: &CancelFlag) -> Result<Samples, CodecError> {
        self.read_rect(0, 0, self.width(), self.height(), cancel)
    }

    /// Drop this image's cached tiles and release the source session.
    ///
    /// Idempotent. After a cancelled operation an incomplete session is
    /// expected and not reported.
    pub fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let evicted = self.store.evict_image(self.id);
        debug!(image = self.id, evicted, cancelled, "raster image closed");
        self.source.close(cancelled)
    }
}

impl Drop for RasterImage {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.store.evict_image(self.id);
        }
    }
}

impl std::fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterImage")
            .field("id", &self.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bands", &self.bands())
            .finish()
    }
}

/// Intersection of a requested rectangle with one tile.
struct Overlap {
    rect: (u32, u32, u32, u32),
    tile_origin: (u32, u32),
    tile_width: u32,
    tile_height: u32,
    bands: usize,
}

impl Overlap {
    fn copy<T: Copy>(&self, src: &[T], dst: &mut [T]) {
        let (rx, ry, rw, rh) = self.rect;
        let (ox, oy) = self.tile_origin;
        let x0 = rx.max(ox);
        let y0 = ry.max(oy);
        let x1 = (rx + rw).min(ox + self.tile_width);
        let y1 = (ry + rh).min(oy + self.tile_height);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let run = (x1 - x0) as usize * self.bands;
        for row in y0..y1 {
            let s = (((row - oy) * self.tile_width + (x0 - ox)) as usize) * self.bands;
            let d = (((row - ry) * rw + (x0 - rx)) as usize) * self.bands;
            dst[d..d + run].copy_from_slice(&src[s..s + run]);
        }
    }
}

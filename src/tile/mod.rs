//! Decoded tiles and the store that caches them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              RasterImage                │
//! └────────────────────┬────────────────────┘
//!                      │ (image id, tile x, tile y)
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │               TileStore                 │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  memory LRU  │  │ overflow files  │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ miss (single-flight)
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │     TileSource (TIFF / JPEG / memory)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileStore`]: two-tier cache, one decode per missing tile
//! - [`TileSource`]: decodes one grid cell through a codec handle
//! - [`RasterTile`]: colour-band samples of one tile

mod overflow;
mod raster;
mod source;
mod store;

pub use overflow::OverflowConfig;
pub use raster::{RasterTile, SampleType, Samples};
pub use source::{JpegTileSource, MemoryTileSource, TiffTileSource, TileSource};
pub use store::{
    ImageId, TileKey, TileStore, TileStoreConfig, TileStoreStats, DEFAULT_MAX_BYTES,
    DEFAULT_MAX_TILES,
};

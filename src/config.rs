//! Command-line configuration for the `raster-codec` binary.
//!
//! This module provides:
//! - Command-line arguments via clap
//! - Environment variables with `RASTER_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `RASTER_CACHE_TILES` - Max decoded tiles kept in memory (default: 4096)
//! - `RASTER_CACHE_BYTES` - Max bytes of decoded tiles kept in memory (default: 256MB)
//! - `RASTER_OVERFLOW_DIR` - Directory for tiles spilled from memory
//! - `RASTER_OVERFLOW_BYTES` - Max bytes of spilled tiles (default: 1GB)
//! - `RASTER_JPEG_QUALITY` - JPEG quality for `convert` (default: 90)
//! - `RASTER_COMPRESSION` - TIFF compression for `convert` (default: deflate)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::codec::DecodeOptions;
use crate::export::{
    ExportOptions, JpegExportOptions, TiffExportOptions, TiffLayout, DEFAULT_JPEG_QUALITY,
};
use crate::format::tiff::{ByteOrder, Compression};
use crate::format::ContainerFormat;
use crate::tile::{OverflowConfig, TileStoreConfig, DEFAULT_MAX_BYTES, DEFAULT_MAX_TILES};

// =============================================================================
// Default Values
// =============================================================================

/// Default byte budget of the overflow directory (1GB).
pub const DEFAULT_OVERFLOW_BYTES: u64 = 1024 * 1024 * 1024;

/// Largest tile edge accepted on the command line.
pub const MAX_TILE_SIZE: u32 = 4096;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Raster Codec - read, inspect and convert tiled TIFF and JPEG images.
#[derive(Parser, Debug, Clone)]
#[command(name = "raster-codec")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the layout and metadata of an image as JSON.
    Info(InfoConfig),

    /// Decode an image and export it atomically to TIFF or JPEG.
    Convert(ConvertConfig),
}

// =============================================================================
// Shared Options
// =============================================================================

/// Tile store sizing, shared by all commands.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CacheArgs {
    /// Maximum number of decoded tiles kept in memory.
    #[arg(long, default_value_t = DEFAULT_MAX_TILES, env = "RASTER_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Maximum bytes of decoded tiles kept in memory.
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES, env = "RASTER_CACHE_BYTES")]
    pub cache_bytes: usize,

    /// Directory for tiles evicted from memory.
    ///
    /// If not specified, a private temporary directory is used.
    #[arg(long, env = "RASTER_OVERFLOW_DIR")]
    pub overflow_dir: Option<PathBuf>,

    /// Maximum bytes of tiles kept in the overflow directory (0 disables it).
    #[arg(long, default_value_t = DEFAULT_OVERFLOW_BYTES, env = "RASTER_OVERFLOW_BYTES")]
    pub overflow_bytes: u64,
}

impl CacheArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_tiles == 0 {
            return Err("cache_tiles must be greater than 0".to_string());
        }
        if self.cache_bytes == 0 {
            return Err("cache_bytes must be greater than 0".to_string());
        }
        if self.overflow_dir.is_some() && self.overflow_bytes == 0 {
            return Err(
                "overflow_dir is set but overflow_bytes is 0. \
                 Raise --overflow-bytes or drop --overflow-dir"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn store_config(&self) -> TileStoreConfig {
        let overflow = (self.overflow_bytes > 0).then(|| OverflowConfig {
            dir: self.overflow_dir.clone(),
            max_bytes: self.overflow_bytes,
        });
        TileStoreConfig {
            max_tiles: self.cache_tiles,
            max_bytes: self.cache_bytes,
            overflow,
        }
    }
}

// =============================================================================
// Info Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Image to inspect.
    pub input: PathBuf,

    /// Zero-based page to open.
    #[arg(long, default_value_t = 0)]
    pub page: u32,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl InfoConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.input.as_os_str().is_empty() {
            return Err("input path is required".to_string());
        }
        Ok(())
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            page: self.page,
            store: None,
        }
    }
}

// =============================================================================
// Convert Command
// =============================================================================

/// Output container selected on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Tiff,
    Jpeg,
}

impl From<FormatArg> for ContainerFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Tiff => ContainerFormat::Tiff,
            FormatArg::Jpeg => ContainerFormat::Jpeg,
        }
    }
}

/// TIFF compression selected on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionArg {
    None,
    #[default]
    Deflate,
    Packbits,
}

impl From<CompressionArg> for Compression {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::None => Compression::None,
            CompressionArg::Deflate => Compression::Deflate,
            CompressionArg::Packbits => Compression::PackBits,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    /// Image to read.
    pub input: PathBuf,

    /// Destination; replaced atomically if it exists.
    pub output: PathBuf,

    /// Output container. Guessed from the output extension if not given.
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Zero-based page of the input to convert.
    #[arg(long, default_value_t = 0)]
    pub page: u32,

    /// Write TIFF strips of N rows.
    #[arg(long, conflicts_with = "tile_size")]
    pub strips: Option<u32>,

    /// Write square TIFF tiles of N pixels (multiple of 16).
    #[arg(long)]
    pub tile_size: Option<u32>,

    /// TIFF compression.
    #[arg(long, value_enum, default_value_t = CompressionArg::Deflate, env = "RASTER_COMPRESSION")]
    pub compression: CompressionArg,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "RASTER_JPEG_QUALITY")]
    pub quality: u8,

    /// Write a big-endian ("MM") TIFF.
    #[arg(long, default_value_t = false)]
    pub big_endian: bool,

    /// Append the first page of this TIFF as page 2 of the output.
    #[arg(long)]
    pub append_page: Option<PathBuf>,

    #[command(flatten)]
    pub cache: CacheArgs,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ConvertConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;

        let container = self.container().ok_or_else(|| {
            format!(
                "cannot guess the output format of '{}'. Use --format tiff|jpeg",
                self.output.display()
            )
        })?;

        if self.quality == 0 || self.quality > 100 {
            return Err("quality must be between 1 and 100".to_string());
        }

        if let Some(rows) = self.strips {
            if rows == 0 {
                return Err("strips must be greater than 0".to_string());
            }
        }

        if let Some(size) = self.tile_size {
            if size == 0 || size % 16 != 0 || size > MAX_TILE_SIZE {
                return Err(format!(
                    "tile_size must be a multiple of 16 between 16 and {}",
                    MAX_TILE_SIZE
                ));
            }
        }

        if container == ContainerFormat::Jpeg {
            if self.strips.is_some() || self.tile_size.is_some() {
                return Err("--strips and --tile-size only apply to TIFF output".to_string());
            }
            if self.append_page.is_some() {
                return Err("--append-page only applies to TIFF output".to_string());
            }
            if self.big_endian {
                return Err("--big-endian only applies to TIFF output".to_string());
            }
        }

        if self.input == self.output {
            return Err("input and output must differ".to_string());
        }

        Ok(())
    }

    /// The output container: `--format`, or the output extension.
    pub fn container(&self) -> Option<ContainerFormat> {
        self.format
            .map(ContainerFormat::from)
            .or_else(|| ContainerFormat::from_extension(&self.output))
    }

    /// Export options for the output container. Call `validate()` first.
    pub fn export_options(&self) -> ExportOptions {
        match self.container() {
            Some(ContainerFormat::Jpeg) => ExportOptions::Jpeg(JpegExportOptions {
                quality: self.quality,
            }),
            _ => {
                let layout = match (self.strips, self.tile_size) {
                    (Some(rows), _) => Some(TiffLayout::Strips {
                        rows_per_strip: rows,
                    }),
                    (None, Some(size)) => Some(TiffLayout::Tiles {
                        width: size,
                        height: size,
                    }),
                    (None, None) => None,
                };
                ExportOptions::Tiff(TiffExportOptions {
                    layout,
                    compression: self.compression.into(),
                    byte_order: if self.big_endian {
                        ByteOrder::BigEndian
                    } else {
                        ByteOrder::LittleEndian
                    },
                    append_page: self.append_page.clone(),
                    ..TiffExportOptions::default()
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

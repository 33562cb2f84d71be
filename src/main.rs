//! Raster Codec - inspect and convert tiled TIFF and JPEG images.
//!
//! This binary wires the CLI to the library's decode and export workers.

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raster_codec::{
    config::{Cli, Command, ConvertConfig, InfoConfig},
    spawn_decode, spawn_export, DecodeOptions, DecodeTask, Decoded, ExportTask, ProgressEvent,
    RasterImage, TileStore,
};

/// Exit status after an interrupted conversion (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Info(config) => run_info(config).await,
        Command::Convert(config) => run_convert(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "raster_codec=debug"
    } else {
        "raster_codec=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Close `image`, logging a failure instead of dropping it. Returns whether
/// the close succeeded.
fn close_image(image: &RasterImage, path: &Path, cancelled: bool) -> bool {
    match image.close(cancelled) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to close {}: {}", path.display(), e);
            false
        }
    }
}

// =============================================================================
// Info Command
// =============================================================================

async fn run_info(config: InfoConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let handle = spawn_decode(DecodeTask {
        path: config.input.clone(),
        options: config.decode_options(),
    });
    let decoded = match handle.join().await {
        Ok(decoded) => decoded,
        Err(e) => {
            error!("Failed to open {}: {}", config.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let summary = info_json(&decoded);
    close_image(&decoded.image, &config.input, false);

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize image info: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Layout plus a summary of each metadata block.
fn info_json(decoded: &Decoded) -> serde_json::Value {
    let descriptor = decoded.image.descriptor();
    let metadata = &decoded.metadata;

    serde_json::json!({
        "path": decoded.image.path().map(|p| p.display().to_string()),
        "descriptor": descriptor,
        "profile": descriptor.color_profile.as_ref().map(|p| serde_json::json!({
            "color_space": p.color_space.trim_end(),
            "channels": p.channels,
            "bytes": p.bytes.len(),
        })),
        "metadata": {
            "exif_tags": metadata.exif.as_ref().map(|e| e.len()),
            "gps": metadata.exif.as_ref().map_or(false, |e| e.gps.is_some()),
            "iptc_datasets": metadata.iptc.as_ref().map(|i| i.datasets.len()),
            "xmp_bytes": metadata.xmp.as_ref().map(|x| x.as_bytes().len()),
            "icc_bytes": metadata.icc.as_ref().map(|p| p.len()),
            "text": &metadata.text,
            "resolution": metadata.resolution,
        },
    })
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(config: ConvertConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let store = match TileStore::new(config.cache.store_config()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to create tile store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Reading {}", config.input.display());
    let decode = spawn_decode(DecodeTask {
        path: config.input.clone(),
        options: DecodeOptions {
            page: config.page,
            store: Some(Arc::clone(&store)),
        },
    });
    let decoded = match decode.join().await {
        Ok(decoded) => decoded,
        Err(e) => {
            error!("Failed to open {}: {}", config.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let descriptor = decoded.image.descriptor();
    info!(
        "  {}x{}, {} band(s), {}-bit, {} tile(s)",
        descriptor.width,
        descriptor.height,
        descriptor.bands,
        descriptor.bits_per_sample,
        descriptor.tile_count()
    );

    let image = Arc::new(decoded.image);
    let mut handle = spawn_export(ExportTask {
        image: Arc::clone(&image),
        metadata: decoded.metadata,
        destination: config.output.clone(),
        options: config.export_options(),
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut last_percent = 0;

    loop {
        tokio::select! {
            event = handle.progress.recv() => match event {
                Some(ProgressEvent::Started { total }) => {
                    info!("Writing {} ({} unit(s))", config.output.display(), total);
                }
                Some(ProgressEvent::Advanced { done, total }) if total > 0 => {
                    let percent = done * 100 / total;
                    if percent >= last_percent + 10 || done == total {
                        last_percent = percent;
                        info!("  {:>3}%", percent);
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                warn!("Interrupted, cancelling export");
                interrupted = true;
                handle.cancel();
            }
        }
    }

    let result = handle.join().await;
    close_image(&image, &config.input, interrupted);

    match result {
        Ok(report) => {
            info!(
                "Wrote {} ({} bytes{})",
                report.path.display(),
                report.bytes,
                if report.replaced { ", replaced" } else { "" }
            );
            let stats = store.stats();
            info!(
                "  Tiles: {} decoded, {} hits, {} spilled ({} bytes on disk)",
                stats.decodes, stats.hits, stats.spills, stats.spilled_bytes
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            warn!("Export cancelled; {} was not modified", config.output.display());
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("Export failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

//! Command-line driver for the rasteract raster computation engine.

mod demo_raster;
mod error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use error::CliError;
use rasteract::{Engine, EngineBuilder, EngineConfig, Footprint, Interpolation, Nodata, PoolId};

#[derive(Parser)]
#[command(name = "rasteract", version, about = "Drive the rasteract tiled raster computation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query a built-in checkerboard recipe raster and report delivery stats.
    Demo {
        /// Raster side length in pixels.
        #[arg(long, default_value_t = 256)]
        size: u32,
        /// Cache (and compute) tile side length in pixels.
        #[arg(long, default_value_t = 64)]
        tile: u32,
        /// Upper bound on in-flight output arrays for the query.
        #[arg(long, default_value_t = 4)]
        max_queue_size: usize,
        /// Worker count for the compute pool; omit to run inline on the scheduler thread.
        #[arg(long)]
        pool_workers: Option<usize>,
        /// Persist cache tiles to this directory instead of keeping them in memory.
        #[arg(long)]
        cache_dir: Option<std::path::PathBuf>,
    },
}

fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            size,
            tile,
            max_queue_size,
            pool_workers,
            cache_dir,
        } => run_demo(size, tile, max_queue_size, pool_workers, cache_dir),
    }
}

fn run_demo(
    size: u32,
    tile: u32,
    max_queue_size: usize,
    pool_workers: Option<usize>,
    cache_dir: Option<std::path::PathBuf>,
) -> Result<(), CliError> {
    if tile == 0 || size == 0 || size % tile != 0 {
        return Err(CliError::Args(format!(
            "--size ({size}) must be a nonzero multiple of --tile ({tile})"
        )));
    }

    let raster_uid = 1;
    let compute_pool = pool_workers.map(|_| PoolId::next());
    let descriptor = demo_raster::build(raster_uid, size, tile, cache_dir, compute_pool);

    let mut builder = EngineBuilder::new(EngineConfig::new()).with_raster(descriptor.clone());
    if let (Some(pool_id), Some(workers)) = (compute_pool, pool_workers) {
        builder = builder.with_pool(pool_id, workers);
        tracing::info!(?pool_id, workers, "compute pool registered");
    }
    let engine: Arc<Engine> = builder.build()?;

    let produce_fps: Vec<Footprint> = descriptor.fp.tile(tile, tile);
    let total = produce_fps.len() as u64;

    println!("rasteract demo: {size}x{size} raster, {tile}x{tile} tiles, {total} tiles to produce");

    let queue = engine.queue_data(
        raster_uid,
        &produce_fps,
        vec![0],
        false,
        Nodata::None,
        Interpolation::Nearest,
        Some(max_queue_size),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    }

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} tiles ({eta})")
            .expect("template is valid"),
    );

    let mut received = 0u64;
    while received < total {
        if shutdown.load(Ordering::SeqCst) {
            println!("\nInterrupted, cancelling query...");
            drop(queue);
            break;
        }
        match queue.recv() {
            Some(_array) => {
                received += 1;
                bar.set_position(received);
            }
            None => break,
        }
        for (raster_uid, err) in engine.take_errors() {
            tracing::error!(raster_uid, error = %err, "fatal error in raster computation");
        }
        if let Some(err) = engine.take_fatal_error() {
            bar.finish_and_clear();
            engine.shutdown();
            return Err(err.into());
        }
    }
    bar.finish_and_clear();

    println!("Delivered {received}/{total} tiles.");
    engine.shutdown();
    Ok(())
}

//! A small built-in recipe raster used by the `demo` command: a checkerboard
//! pattern with no primitives, so the CLI can exercise the engine end to end
//! without needing a real geospatial dataset on disk (spec §1's
//! external-collaborator boundary — there is nothing standing in for a real
//! `DataSource` here).

use std::sync::Arc;

use rasteract::{AffineGrid, Array, DType, Footprint, Nodata, PoolAssignments, PoolId, RasterDescriptor};

pub fn build(
    uid: u64,
    size: u32,
    cache_tile: u32,
    cache_dir: Option<std::path::PathBuf>,
    compute_pool: Option<PoolId>,
) -> Arc<RasterDescriptor> {
    let grid = AffineGrid {
        tl_x: 0.0,
        tl_y: 0.0,
        px_w: 1.0,
        px_h: -1.0,
    };

    Arc::new(RasterDescriptor {
        uid,
        fp: Footprint::new(grid, (size, size)),
        dtype: DType::F32,
        channel_count: 1,
        nodata: Nodata::None,
        cache_dir,
        cache_tile_size: (cache_tile, cache_tile),
        compute_tile_size: (cache_tile, cache_tile),
        max_resampling_size: None,
        primitives: Vec::new(),
        pools: PoolAssignments {
            compute: compute_pool,
            ..PoolAssignments::default()
        },
        compute_array: Arc::new(|fp, _primitive_fps, _primitive_arrays| {
            let (w, h) = (fp.width(), fp.height());
            let mut data = Vec::with_capacity((w * h) as usize);
            for y in 0..h {
                for x in 0..w {
                    let checker = ((x / 8 + y / 8) % 2) as f32;
                    data.push(checker);
                }
            }
            Ok(Array {
                shape: (h, w, 1),
                data: Arc::new(data),
            })
        }),
        merge_arrays: Arc::new(|fp, arrays| {
            let mut merged = vec![0.0f32; (fp.width() * fp.height()) as usize];
            for (key, array) in arrays {
                // Each compute tile is the same size as its cache tile here,
                // so there is exactly one entry to copy through unchanged.
                let _ = key;
                merged.copy_from_slice(&array.data);
            }
            Ok(Array {
                shape: (fp.height(), fp.width(), 1),
                data: Arc::new(merged),
            })
        }),
    })
}

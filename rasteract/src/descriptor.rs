//! The external "Raster interface" the core consumes (spec §6), plus the
//! small value types (dtype, nodata, interpolation) referenced throughout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::EngineError;
use crate::footprint::Footprint;
use crate::pool::PoolId;
use crate::query::{Array, BoundedQueue};

/// Pixel storage type of a raster. The core only needs to compare and
/// report this, never to interpret sample bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    U16,
    I16,
    F32,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::F32 => "f32",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Nodata {
    None,
    Value(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    Cubic,
}

/// An upstream raster this recipe raster's `compute_array` consumes from,
/// named the way the spec's `primitive descriptors (named upstream
/// rasters)` describes (spec §3, §6).
#[derive(Clone)]
pub struct PrimitiveDescriptor {
    pub name: String,
    pub raster_uid: u64,
    /// Launches a query against the upstream raster for the given
    /// footprint and returns the queue its arrays will arrive on. Wired by
    /// the `Engine` at raster-registration time so this descriptor doesn't
    /// need to hold a reference back to the engine itself.
    pub launch_query: Arc<dyn Fn(Footprint) -> Arc<BoundedQueue> + Send + Sync>,
}

/// Per-raster pool assignments (spec §6). `None` means inline execution on
/// the scheduler thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolAssignments {
    pub io: Option<PoolId>,
    pub compute: Option<PoolId>,
    pub merge: Option<PoolId>,
    pub resample: Option<PoolId>,
}

type ComputeFn =
    dyn Fn(&Footprint, &[Footprint], &[Array]) -> Result<Array, EngineError> + Send + Sync;
type MergeFn =
    dyn Fn(&Footprint, &HashMap<(i64, i64), Array>) -> Result<Array, EngineError> + Send + Sync;

/// The raster interface consumed by the core (spec §6). Identity, grid
/// geometry, tiling, primitive wiring, and the two user kernels a recipe
/// raster is built from.
pub struct RasterDescriptor {
    pub uid: u64,
    pub fp: Footprint,
    pub dtype: DType,
    pub channel_count: u32,
    pub nodata: Nodata,
    pub cache_dir: Option<PathBuf>,
    pub cache_tile_size: (u32, u32),
    pub compute_tile_size: (u32, u32),
    pub max_resampling_size: Option<u32>,
    pub primitives: Vec<PrimitiveDescriptor>,
    pub pools: PoolAssignments,
    pub compute_array: Arc<ComputeFn>,
    pub merge_arrays: Arc<MergeFn>,
}

impl RasterDescriptor {
    /// The frozen, ordered set of cache tiles covering the whole raster
    /// (spec §3 `cache_fps`).
    pub fn cache_fps(&self) -> Vec<Footprint> {
        self.fp.tile(self.cache_tile_size.0, self.cache_tile_size.1)
    }

    /// The frozen set of compute tiles, one per cache tile sub-tiled by
    /// `compute_tile_size` (spec §3 `compute_fps`).
    pub fn compute_fps(&self) -> Vec<Footprint> {
        self.cache_fps()
            .iter()
            .flat_map(|c| c.tile(self.compute_tile_size.0, self.compute_tile_size.1))
            .collect()
    }

    /// Compute tiles that union to cover the given cache tile (spec §3
    /// `compute_fps_of_cache_fp`).
    pub fn compute_fps_of_cache_fp(&self, cache_fp: &Footprint) -> Vec<Footprint> {
        cache_fp.tile(self.compute_tile_size.0, self.compute_tile_size.1)
    }

    /// The cache tile a compute tile belongs to (spec §3
    /// `cache_fps_of_compute_fp`). Found by containment since compute tiles
    /// never straddle a cache tile boundary.
    pub fn cache_fp_of_compute_fp(&self, compute_fp: &Footprint) -> Option<Footprint> {
        self.cache_fps()
            .into_iter()
            .find(|c| compute_fp.slice_in(c).is_some())
    }

    /// Cache tiles overlapping a raster-aligned sample footprint (spec §6
    /// `cache_fps_of_fp`).
    pub fn cache_fps_of_fp(&self, sample_fp: &Footprint) -> Vec<Footprint> {
        self.cache_fps()
            .into_iter()
            .filter(|c| c.share_area(sample_fp))
            .collect()
    }

    /// The raster-aligned region a production footprint should be sampled
    /// from, given an interpolation mode (spec §6
    /// `build_sampling_footprint_to_remap`). For same-grid queries this is
    /// exactly the intersection with the raster footprint; off-grid
    /// queries additionally require no extra padding in this simplified
    /// stand-in (see DESIGN.md).
    pub fn build_sampling_footprint_to_remap(
        &self,
        prod_fp: &Footprint,
        _interpolation: Interpolation,
    ) -> Option<Footprint> {
        self.fp.intersection(prod_fp)
    }

    /// Content-addressed filename prefix for a cache tile (spec §6: encodes
    /// raster footprint size, tile size, tile pixel-index, and tile index).
    pub fn fname_prefix_of_cache_fp(&self, cache_fp: &Footprint) -> String {
        let idx = self
            .cache_fps()
            .iter()
            .position(|c| c.fuzzy_eq(cache_fp))
            .unwrap_or(0);
        let slice = cache_fp.slice_in(&self.fp);
        let (x0, y0) = slice.map(|s| (s.x0, s.y0)).unwrap_or((0, 0));
        format!(
            "rs{}x{}_ts{}x{}_px{}_{}_idx{}",
            self.fp.width(),
            self.fp.height(),
            self.cache_tile_size.0,
            self.cache_tile_size.1,
            x0,
            y0,
            idx
        )
    }
}

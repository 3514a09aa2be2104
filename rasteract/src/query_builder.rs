//! Turns raw `queue_data` parameters into a [`QueryInfo`] (spec §3 "Query
//! info" derivation). The one place that actually runs the
//! same_grid/share_area/sample_fp/cache_fps/resample_fps math the spec
//! describes in prose against a concrete [`RasterDescriptor`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{Interpolation, Nodata, RasterDescriptor};
use crate::footprint::Footprint;
use crate::query::{BoundedQueue, ProdFootprintInfo, QueryInfo};

#[allow(clippy::too_many_arguments)]
pub fn build_query_info(
    descriptor: &RasterDescriptor,
    produce_fps: &[Footprint],
    channel_ids: Vec<u32>,
    dst_nodata: Nodata,
    interpolation: Interpolation,
    is_flat: bool,
    max_queue_size: usize,
    parent_uid: Option<u64>,
    key_in_parent: Option<String>,
    queue: &Arc<BoundedQueue>,
) -> QueryInfo {
    let produced = produce_fps
        .iter()
        .map(|fp| build_one(descriptor, fp, interpolation))
        .collect();
    QueryInfo::new(
        descriptor.uid,
        produced,
        channel_ids,
        dst_nodata,
        interpolation,
        is_flat,
        max_queue_size,
        parent_uid,
        key_in_parent,
        queue,
    )
}

/// Derives everything `ProductionGate`/`Producer`/`Resampler` need for one
/// requested output footprint (spec §3).
fn build_one(descriptor: &RasterDescriptor, prod_fp: &Footprint, interpolation: Interpolation) -> ProdFootprintInfo {
    let same_grid = descriptor.fp.same_grid(prod_fp);
    let share_area = descriptor.fp.share_area(prod_fp);
    let sample_fp = descriptor.build_sampling_footprint_to_remap(prod_fp, interpolation);
    let cache_fps = sample_fp
        .map(|s| descriptor.cache_fps_of_fp(&s))
        .unwrap_or_default();

    let resample_fps = match descriptor.max_resampling_size {
        Some(size) if size > 0 => prod_fp.tile(size, size),
        _ => vec![*prod_fp],
    };

    let mut resample_cache_deps_fps = HashMap::new();
    let mut resample_sample_dep_fp = HashMap::new();
    for (idx, resample_fp) in resample_fps.iter().enumerate() {
        let dep_fp = sample_fp.and_then(|s| resample_fp.intersection(&s));
        let deps = match dep_fp {
            Some(dep) => cache_fps.iter().filter(|c| c.share_area(&dep)).copied().collect(),
            None => Vec::new(),
        };
        resample_cache_deps_fps.insert(idx, deps);
        resample_sample_dep_fp.insert(idx, dep_fp);
    }

    ProdFootprintInfo {
        prod_fp: *prod_fp,
        same_grid,
        share_area,
        sample_fp,
        cache_fps,
        resample_fps,
        resample_cache_deps_fps,
        resample_sample_dep_fp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DType, PoolAssignments};
    use crate::footprint::AffineGrid;
    use crate::query::Array;

    fn grid() -> AffineGrid {
        AffineGrid {
            tl_x: 0.0,
            tl_y: 0.0,
            px_w: 1.0,
            px_h: -1.0,
        }
    }

    fn test_descriptor(max_resampling_size: Option<u32>) -> RasterDescriptor {
        RasterDescriptor {
            uid: 1,
            fp: Footprint::new(grid(), (16, 16)),
            dtype: DType::F32,
            channel_count: 1,
            nodata: Nodata::None,
            cache_dir: None,
            cache_tile_size: (8, 8),
            compute_tile_size: (4, 4),
            max_resampling_size,
            primitives: Vec::new(),
            pools: PoolAssignments::default(),
            compute_array: Arc::new(|fp, _, _| {
                Ok(Array::filled((fp.height(), fp.width(), 1), 0.0))
            }),
            merge_arrays: Arc::new(|fp, _| Ok(Array::filled((fp.height(), fp.width(), 1), 0.0))),
        }
    }

    #[test]
    fn fully_inside_query_covers_every_overlapping_cache_tile() {
        let descriptor = test_descriptor(None);
        let prod_fp = Footprint::new(grid(), (16, 16));
        let info = build_one(&descriptor, &prod_fp, Interpolation::Nearest);
        assert!(info.same_grid);
        assert!(info.sample_fp.is_some());
        assert_eq!(info.cache_fps.len(), 4);
        assert_eq!(info.resample_fps.len(), 1);
        assert_eq!(info.resample_sample_dep_fp[&0], info.sample_fp);
    }

    #[test]
    fn outside_the_raster_has_no_sample_fp_and_produces_nodata_deps() {
        let descriptor = test_descriptor(None);
        let prod_fp = Footprint::new(
            AffineGrid {
                tl_x: 100.0,
                tl_y: 0.0,
                px_w: 1.0,
                px_h: -1.0,
            },
            (4, 4),
        );
        let info = build_one(&descriptor, &prod_fp, Interpolation::Nearest);
        assert!(info.sample_fp.is_none());
        assert!(info.cache_fps.is_empty());
        assert_eq!(info.resample_sample_dep_fp[&0], None);
    }

    #[test]
    fn max_resampling_size_splits_into_several_resample_tiles() {
        let descriptor = test_descriptor(Some(4));
        let prod_fp = Footprint::new(grid(), (8, 8));
        let info = build_one(&descriptor, &prod_fp, Interpolation::Nearest);
        assert_eq!(info.resample_fps.len(), 4);
        for idx in 0..4 {
            assert!(info.resample_sample_dep_fp[&idx].is_some());
        }
    }

    #[test]
    fn query_info_produce_count_matches_input_footprints() {
        let descriptor = test_descriptor(None);
        let queue = BoundedQueue::new(4);
        let fps = vec![Footprint::new(grid(), (8, 8)), Footprint::new(grid(), (16, 16))];
        let qi = build_query_info(
            &descriptor,
            &fps,
            vec![0],
            Nodata::None,
            Interpolation::Nearest,
            false,
            4,
            None,
            None,
            &queue,
        );
        assert_eq!(qi.produce_count(), 2);
    }
}

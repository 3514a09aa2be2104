//! Producer (spec §4.7): assembles one production tile at a time — sample
//! the cache tiles it depends on, stitch them into one sampling footprint,
//! resample into the query's resample tiles, then reassemble those into the
//! final output array.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::error::CacheError;
use crate::footprint::Footprint;
use crate::message::{Address, Envelope, Payload};
use crate::query::{Array, QueryId, QueryInfo};

use super::cache_extractor::CacheExtractorMsg;
use super::queries_handler::QueriesHandlerMsg;
use super::resampler::ResamplerMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum ProducerMsg {
    /// ProductionGate admitted this production index (spec §4.6).
    MakeThisArray { qi: Arc<QueryInfo>, prod_idx: usize },
    /// CacheExtractor delivered (or failed to deliver) one of this
    /// production tile's cache dependencies.
    SampledTileReady {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        cache_fp: Footprint,
        result: Result<Array, CacheError>,
    },
    /// Resampler finished one resample tile.
    ResampledTileReady {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_idx: usize,
        array: Array,
    },
}

struct ProdState {
    qi: Arc<QueryInfo>,
    sample_pieces: HashMap<(i64, i64), (Footprint, Array)>,
    sample_pending: HashSet<(i64, i64)>,
    resample_results: HashMap<usize, Array>,
    resample_total: usize,
}

pub struct Producer {
    raster_uid: u64,
    in_progress: HashMap<(QueryId, usize), ProdState>,
}

impl Producer {
    pub fn new(raster_uid: u64) -> Self {
        Self {
            raster_uid,
            in_progress: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: ProducerMsg, descriptor: &RasterDescriptor) -> Vec<Envelope> {
        match msg {
            ProducerMsg::MakeThisArray { qi, prod_idx } => self.make_this_array(qi, prod_idx),
            ProducerMsg::SampledTileReady { qi, prod_idx, cache_fp, result } => {
                self.sampled_tile_ready(qi, prod_idx, cache_fp, result, descriptor)
            }
            ProducerMsg::ResampledTileReady { qi, prod_idx, resample_idx, array } => {
                self.resampled_tile_ready(qi, prod_idx, resample_idx, array)
            }
        }
    }

    fn make_this_array(&mut self, qi: Arc<QueryInfo>, prod_idx: usize) -> Vec<Envelope> {
        let info = &qi.produced[prod_idx];
        let resample_total = info.resample_fps.len();
        match info.sample_fp {
            None => {
                self.in_progress.insert(
                    (qi.id, prod_idx),
                    ProdState {
                        qi: qi.clone(),
                        sample_pieces: HashMap::new(),
                        sample_pending: HashSet::new(),
                        resample_results: HashMap::new(),
                        resample_total,
                    },
                );
                (0..resample_total)
                    .map(|resample_idx| self.nodata_envelope(qi.clone(), prod_idx, resample_idx))
                    .collect()
            }
            Some(_) => {
                let cache_fps = info.cache_fps.clone();
                let sample_pending = cache_fps.iter().map(|f| f.tiebreak_key()).collect();
                self.in_progress.insert(
                    (qi.id, prod_idx),
                    ProdState {
                        qi: qi.clone(),
                        sample_pieces: HashMap::new(),
                        sample_pending,
                        resample_results: HashMap::new(),
                        resample_total,
                    },
                );
                vec![Envelope::basic(
                    Address::Raster(self.raster_uid),
                    Payload::Raster(RasterMsg::CacheExtractor(CacheExtractorMsg::SampleTheseCacheFiles {
                        qi,
                        prod_idx,
                        cache_fps,
                    })),
                )]
            }
        }
    }

    fn sampled_tile_ready(
        &mut self,
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        cache_fp: Footprint,
        result: Result<Array, CacheError>,
        descriptor: &RasterDescriptor,
    ) -> Vec<Envelope> {
        let key = (qi.id, prod_idx);
        let array = match result {
            Ok(array) => array,
            Err(e) => {
                // This production tile will never complete; other tiles of
                // the same query are unaffected (spec §7 leaves retry
                // policy unspecified — see DESIGN.md).
                tracing::error!(error = %e, "cache sample read failed, abandoning production tile");
                self.in_progress.remove(&key);
                return Vec::new();
            }
        };
        let Some(state) = self.in_progress.get_mut(&key) else {
            return Vec::new();
        };
        state.sample_pieces.insert(cache_fp.tiebreak_key(), (cache_fp, array));
        state.sample_pending.remove(&cache_fp.tiebreak_key());
        if !state.sample_pending.is_empty() {
            return Vec::new();
        }

        let info = &qi.produced[prod_idx];
        let Some(sample_fp) = info.sample_fp else {
            // `sample_fp` is always set by `query_builder::build_query_info`
            // whenever `cache_fps` is non-empty (which is what got this
            // production tile routed through the sampling path in the first
            // place); treat a violated invariant the same as a failed read
            // rather than unwinding the scheduler thread over it.
            tracing::error!("production tile reached sampling completion with no sample_fp, abandoning it");
            self.in_progress.remove(&key);
            return Vec::new();
        };
        let stitched = stitch(sample_fp, descriptor.channel_count, &state.sample_pieces);

        (0..info.resample_fps.len())
            .map(|resample_idx| match info.resample_sample_dep_fp.get(&resample_idx) {
                Some(Some(_)) => Envelope::basic(
                    Address::Raster(self.raster_uid),
                    Payload::Raster(RasterMsg::Resampler(ResamplerMsg::ResampleFromSample {
                        qi: qi.clone(),
                        prod_idx,
                        resample_idx,
                        sample_array: stitched.clone(),
                    })),
                ),
                _ => self.nodata_envelope(qi.clone(), prod_idx, resample_idx),
            })
            .collect()
    }

    fn resampled_tile_ready(
        &mut self,
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_idx: usize,
        array: Array,
    ) -> Vec<Envelope> {
        let key = (qi.id, prod_idx);
        let Some(state) = self.in_progress.get_mut(&key) else {
            return Vec::new();
        };
        state.resample_results.insert(resample_idx, array);
        if state.resample_results.len() < state.resample_total {
            return Vec::new();
        }
        let Some(ProdState { qi, resample_results, .. }) = self.in_progress.remove(&key) else {
            // Can't happen: `get_mut` above just confirmed `key` is present
            // and nothing else removes it in between. Handled rather than
            // unwrapped so a future refactor here fails soft, not by taking
            // the scheduler thread down.
            return Vec::new();
        };
        let info = &qi.produced[prod_idx];
        let out_c = if qi.is_flat { 1 } else { qi.channel_ids.len() as u32 };
        let array = assemble(info.prod_fp, out_c, &info.resample_fps, &resample_results);
        vec![Envelope::basic(
            Address::Raster(self.raster_uid),
            Payload::Raster(RasterMsg::QueriesHandler(QueriesHandlerMsg::MadeThisArray { qi, prod_idx, array })),
        )]
    }

    fn nodata_envelope(&self, qi: Arc<QueryInfo>, prod_idx: usize, resample_idx: usize) -> Envelope {
        Envelope::basic(
            Address::Raster(self.raster_uid),
            Payload::Raster(RasterMsg::Resampler(ResamplerMsg::ResampleNodata { qi, prod_idx, resample_idx })),
        )
    }

    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        self.in_progress.retain(|(q, _), _| *q != qi);
        Vec::new()
    }
}

/// Copies every `(cache_fp, array)` piece into its place inside a
/// `dst_fp`-shaped buffer, using the footprint intersection both pieces
/// share rather than assuming full containment (cache tiles at the raster's
/// edge only partially overlap a sample footprint).
fn stitch(dst_fp: Footprint, channel_count: u32, pieces: &HashMap<(i64, i64), (Footprint, Array)>) -> Array {
    let (h, w) = (dst_fp.height(), dst_fp.width());
    let mut out = vec![0f32; h as usize * w as usize * channel_count as usize];
    for (src_fp, array) in pieces.values() {
        copy_overlap(*src_fp, array, dst_fp, &mut out, w, channel_count);
    }
    Array {
        shape: (h, w, channel_count),
        data: Arc::new(out),
    }
}

fn assemble(dst_fp: Footprint, channel_count: u32, src_fps: &[Footprint], results: &HashMap<usize, Array>) -> Array {
    let (h, w) = (dst_fp.height(), dst_fp.width());
    let mut out = vec![0f32; h as usize * w as usize * channel_count as usize];
    for (idx, src_fp) in src_fps.iter().enumerate() {
        if let Some(array) = results.get(&idx) {
            copy_overlap(*src_fp, array, dst_fp, &mut out, w, channel_count);
        }
    }
    Array {
        shape: (h, w, channel_count),
        data: Arc::new(out),
    }
}

fn copy_overlap(src_fp: Footprint, src: &Array, dst_fp: Footprint, dst: &mut [f32], dst_w: u32, channels: u32) {
    let Some(overlap) = src_fp.intersection(&dst_fp) else { return };
    let Some(src_slice) = overlap.slice_in(&src_fp) else { return };
    let Some(dst_slice) = overlap.slice_in(&dst_fp) else { return };
    let src_w = src_fp.width() as usize;
    let c = channels as usize;
    for row in 0..src_slice.h {
        let src_row = (src_slice.y0 + row) as usize;
        let dst_row = (dst_slice.y0 + row) as usize;
        for col in 0..src_slice.w {
            let src_col = (src_slice.x0 + col) as usize;
            let dst_col = (dst_slice.x0 + col) as usize;
            let src_base = (src_row * src_w + src_col) * c;
            let dst_base = (dst_row * dst_w as usize + dst_col) * c;
            dst[dst_base..dst_base + c].copy_from_slice(&src.data[src_base..src_base + c]);
        }
    }
}

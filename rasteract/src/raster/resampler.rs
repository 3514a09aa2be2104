//! Resampler (spec §4.9 component table row "Resampler"): produces one
//! output-shaped tile, either filled with nodata or cropped/recombined from
//! a sampled source array. Since [`crate::footprint::Footprint`] is a
//! same-grid stand-in (see its module docs), "resampling" here is always a
//! channel-selecting crop rather than real interpolation — the
//! `Interpolation` the query requested is accepted by
//! `RasterDescriptor::build_sampling_footprint_to_remap` but has nothing to
//! act on once grids always match.

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{Nodata, RasterDescriptor};
use crate::error::EngineError;
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolJob, PoolMsg, PoolOutcome, WaitingClass};
use crate::query::{Array, QueryId, QueryInfo};

use super::producer::ProducerMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum ResamplerMsg {
    ResampleNodata {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_idx: usize,
    },
    ResampleFromSample {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_idx: usize,
        sample_array: Array,
    },
}

pub struct Resampler {
    descriptor: Arc<RasterDescriptor>,
    in_flight: HashMap<JobId, (QueryId, usize, usize)>,
}

fn out_channel_count(qi: &QueryInfo) -> u32 {
    if qi.is_flat {
        1
    } else {
        qi.channel_ids.len() as u32
    }
}

fn nodata_value(n: Nodata) -> f32 {
    match n {
        Nodata::Value(v) => v as f32,
        Nodata::None => 0.0,
    }
}

impl Resampler {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            in_flight: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: ResamplerMsg) -> Vec<Envelope> {
        let raster_uid = self.descriptor.uid;
        let channel_count = self.descriptor.channel_count;
        let job_id = JobId::next();

        let (qi, prod_idx, resample_idx, run): (
            Arc<QueryInfo>,
            usize,
            usize,
            Box<dyn FnOnce() -> PoolOutcome + Send>,
        ) = match msg {
            ResamplerMsg::ResampleNodata {
                qi,
                prod_idx,
                resample_idx,
            } => {
                let resample_fp = qi.produced[prod_idx].resample_fps[resample_idx];
                let out_c = out_channel_count(&qi);
                let fill = nodata_value(qi.dst_nodata);
                let run = move || -> PoolOutcome {
                    PoolOutcome::Resampled(Ok(Array::filled(
                        (resample_fp.height(), resample_fp.width(), out_c),
                        fill,
                    )))
                };
                (qi, prod_idx, resample_idx, Box::new(run))
            }
            ResamplerMsg::ResampleFromSample {
                qi,
                prod_idx,
                resample_idx,
                sample_array,
            } => {
                let info = &qi.produced[prod_idx];
                let resample_fp = info.resample_fps[resample_idx];
                // `Producer` only ever sends `ResampleFromSample` once it has
                // resolved both of these for this `resample_idx` (spec §4.7
                // "resample_needs"); a missing one is an invariant violation
                // elsewhere, not something to unwind the scheduler thread
                // over, so the resample tile is abandoned and logged like
                // any other internal fault (see producer.rs's sample_fp
                // handling).
                let (Some(sample_fp), Some(Some(dep_fp))) =
                    (info.sample_fp, info.resample_sample_dep_fp.get(&resample_idx).copied())
                else {
                    tracing::error!(
                        resample_idx,
                        "ResampleFromSample with no sample_fp/dependency footprint, abandoning resample tile"
                    );
                    return Vec::new();
                };
                // Repeats are intentional here: a query may list the same
                // source channel twice to duplicate it in the output.
                let channel_ids = qi.channel_ids.clone();
                let out_c = out_channel_count(&qi);
                let run = crop_and_select(
                    sample_array,
                    sample_fp,
                    dep_fp,
                    resample_fp,
                    channel_ids,
                    channel_count,
                    out_c,
                );
                (qi, prod_idx, resample_idx, run)
            }
        };

        self.in_flight.insert(job_id, (qi.id, prod_idx, resample_idx));
        let job = PoolJob {
            id: job_id,
            class: WaitingClass::Production {
                qi: qi.id,
                prod_idx,
                action_priority: 1,
                footprint: qi.produced[prod_idx].prod_fp,
            },
            origin: Address::Raster(raster_uid),
            run,
        };
        vec![match self.descriptor.pools.resample {
            Some(pool_id) => Envelope::basic(
                Address::Pool(pool_id),
                Payload::Pool(PoolMsg::WaitingRoom(crate::pool::WaitingRoomMsg::NewJob(job))),
            ),
            None => {
                let outcome = (job.run)();
                Envelope::basic(
                    Address::Raster(raster_uid),
                    Payload::Raster(RasterMsg::PoolJobDone(crate::pool::JobDone {
                        job_id: job.id,
                        outcome,
                    })),
                )
            }
        }]
    }

    /// Routes a completed resample back to `Producer`, which accumulates
    /// every resample tile of one production tile into the final array.
    pub fn job_done(&mut self, job_id: JobId, result: Result<Array, EngineError>) -> Vec<Envelope> {
        let Some((qi, prod_idx, resample_idx)) = self.in_flight.remove(&job_id) else {
            return Vec::new();
        };
        match result {
            Ok(array) => vec![Envelope::basic(
                Address::Raster(self.descriptor.uid),
                Payload::Raster(RasterMsg::Producer(ProducerMsg::ResampledTileReady {
                    qi,
                    prod_idx,
                    resample_idx,
                    array,
                })),
            )],
            Err(_) => Vec::new(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn crop_and_select(
    sample_array: Array,
    sample_fp: Footprint,
    dep_fp: Footprint,
    resample_fp: Footprint,
    channel_ids: Vec<u32>,
    in_channels: u32,
    out_channels: u32,
) -> Box<dyn FnOnce() -> PoolOutcome + Send> {
    Box::new(move || -> PoolOutcome {
        let Some(slice) = dep_fp.slice_in(&sample_fp) else {
            return PoolOutcome::Resampled(Err(EngineError::ComputeShapeMismatch {
                compute_fp: "resample crop".to_string(),
                found: (0, 0, 0),
                expected: (resample_fp.height(), resample_fp.width(), out_channels),
            }));
        };
        let sw = sample_fp.width() as usize;
        let in_c = in_channels as usize;
        let mut out = Vec::with_capacity(slice.h as usize * slice.w as usize * out_channels as usize);
        for row in 0..slice.h {
            let src_row = slice.y0 + row;
            for col in 0..slice.w {
                let src_col = slice.x0 + col;
                let base = (src_row as usize * sw + src_col as usize) * in_c;
                for &ch in &channel_ids {
                    out.push(sample_array.data[base + ch as usize]);
                }
            }
        }
        PoolOutcome::Resampled(Ok(Array {
            shape: (slice.h, slice.w, out_channels),
            data: Arc::new(out),
        }))
    })
}

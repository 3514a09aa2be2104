//! ComputationAccumulator (spec §4.11): collects every compute tile of one
//! cache tile before handing the full set to `Merger`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::footprint::Footprint;
use crate::message::{Address, Envelope, Payload};
use crate::query::Array;

use super::merger::MergerMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum AccumulatorMsg {
    ArrayReady {
        cache_fp: Footprint,
        compute_fp: Footprint,
        array: Array,
    },
}

struct Pending {
    cache_fp: Footprint,
    arrays: HashMap<(i64, i64), Array>,
    expected: usize,
}

pub struct Accumulator {
    descriptor: Arc<RasterDescriptor>,
    pending: HashMap<(i64, i64), Pending>,
}

impl Accumulator {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            pending: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: AccumulatorMsg) -> Vec<Envelope> {
        let AccumulatorMsg::ArrayReady {
            cache_fp,
            compute_fp,
            array,
        } = msg;
        let key = cache_fp.tiebreak_key();
        let entry = self.pending.entry(key).or_insert_with(|| Pending {
            cache_fp,
            arrays: HashMap::new(),
            expected: self.descriptor.compute_fps_of_cache_fp(&cache_fp).len(),
        });
        entry.arrays.insert(compute_fp.tiebreak_key(), array);
        if entry.arrays.len() < entry.expected {
            return Vec::new();
        }
        let Some(Pending { cache_fp, arrays, .. }) = self.pending.remove(&key) else {
            // Can't happen: `entry` above just confirmed `key` is present and
            // nothing else removes it in between. Handled rather than
            // unwrapped so a future refactor here fails soft, not by taking
            // the scheduler thread down.
            return Vec::new();
        };
        vec![Envelope::basic(
            Address::Raster(self.descriptor.uid),
            Payload::Raster(RasterMsg::Merger(MergerMsg::MergeThoseArrays { cache_fp, arrays })),
        )]
    }
}

// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HDCC sequencing buffer: caption blocks arrive in decode order and are
//! re-emitted in display order.
//!
//! Blocks are stored into a fixed window of buckets keyed by display-order
//! index relative to the current anchor (I/P) frame. When a new anchor
//! arrives, the buckets are flushed in ascending index order, restoring each
//! bucket's frame timestamp.

use crate::caption::{BufferDataType, CaptionSink};
use base::time::MsTime;
use base::Error;
use tracing::debug;

/// Maximum number of B-frames on either side of an anchor frame.
pub const MAX_B_FRAMES: i32 = 50;

/// Number of buckets: B-frames can be (temporally) before or after the anchor.
pub const SORT_BUF: usize = (2 * MAX_B_FRAMES + 1) as usize;

/// Caption bytes one bucket can hold. MP4 samples can carry far more cc data
/// per frame than broadcast streams, hence the 10x factor.
const BUCKET_CAPACITY: usize = 10 * 31 * 3 + 1;

/// Whether a second store to the same display-order index appends or starts
/// over. MP4 sample processing needs `Append`; at least some elementary
/// streams repeat slices and need `Overwrite`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorePolicy {
    Append,
    Overwrite,
}

struct Bucket {
    /// Number of 3-byte tuples stored.
    count: usize,
    fts: MsTime,
    data: Vec<u8>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            count: 0,
            fts: MsTime(0),
            data: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.count = 0;
        self.fts = MsTime(0);
        self.data.clear();
    }
}

pub struct Sequencer {
    buckets: Vec<Bucket>,
    anchor_seq: Option<i32>,
    has_buffered: bool,
    policy: StorePolicy,
    /// In GOP mode the fts is set only once for the whole GOP; recreate the
    /// per-frame time from the sequence number and frame rate.
    use_gop_as_pts: bool,
    blocks_dropped: u64,
}

impl Sequencer {
    pub fn new(policy: StorePolicy, use_gop_as_pts: bool) -> Self {
        Sequencer {
            buckets: (0..SORT_BUF).map(|_| Bucket::new()).collect(),
            anchor_seq: None,
            has_buffered: false,
            policy,
            use_gop_as_pts,
            blocks_dropped: 0,
        }
    }

    pub fn clear(&mut self) {
        for b in &mut self.buckets {
            b.clear();
        }
        self.has_buffered = false;
        self.anchor_seq = None;
    }

    pub fn has_buffered(&self) -> bool {
        self.has_buffered
    }

    /// Tuples dropped because a bucket was full.
    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped
    }

    /// Sets a new anchor frame that stored B-frames refer to.
    pub fn anchor(&mut self, seq: i32) {
        self.anchor_seq = Some(seq);
    }

    /// Buffers `cc_count` tuples from `cc_data` (which may carry a trailing
    /// 0xFF sentinel byte) at display-order index `seq`.
    ///
    /// An index outside the bucket window means an anchor frame went missing;
    /// the buffer is flushed and re-anchored at `seq` to recover.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
        cc_data: &[u8],
        cc_count: usize,
        seq: i32,
        fts_now: MsTime,
        fps: f64,
    ) -> Result<(), Error> {
        let anchor = match self.anchor_seq {
            Some(a) => a,
            None => {
                self.anchor(seq);
                seq
            }
        };
        let mut index = seq - anchor + MAX_B_FRAMES;
        if !(0..SORT_BUF as i32).contains(&index) {
            debug!(
                target: "ccdemux::vides",
                "too many B-frames or missing anchor frame (seq {seq}, anchor {anchor}), \
                 flushing to recover"
            );
            self.process(sink, data_type)?;
            self.anchor(seq);
            index = MAX_B_FRAMES;
        }
        let bucket = &mut self.buckets[index as usize];

        self.has_buffered = true;

        let mut fts = fts_now;
        if self.use_gop_as_pts && fps > 0.0 {
            fts = MsTime(fts.0 + (seq as f64 * 1000.0 / fps) as i64);
        }

        if cc_count == 0 || cc_data.is_empty() {
            return Ok(());
        }
        bucket.fts = fts;
        if self.policy == StorePolicy::Overwrite {
            bucket.count = 0;
            bucket.data.clear();
        } else {
            // Drop the previous trailing sentinel; the new data brings its own.
            bucket.data.truncate(bucket.count * 3);
        }
        let wanted = std::cmp::min(cc_data.len(), cc_count * 3 + 1);
        let room = BUCKET_CAPACITY - bucket.data.len();
        if wanted > room {
            let kept = room / 3;
            self.blocks_dropped += (cc_count - kept) as u64;
            debug!(
                target: "ccdemux::vides",
                "caption bucket full at index {index}; dropping {} tuples",
                cc_count - kept
            );
            bucket.data.extend_from_slice(&cc_data[..kept * 3]);
            bucket.count += kept;
        } else {
            bucket.data.extend_from_slice(&cc_data[..wanted]);
            bucket.count += cc_count;
        }
        Ok(())
    }

    /// Flushes all buffered blocks to `sink` in ascending display order,
    /// restoring each bucket's timestamp, then clears the store.
    pub fn process(
        &mut self,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
    ) -> Result<(), Error> {
        debug!(target: "ccdemux::vides", "flushing HD caption blocks");
        for i in 0..SORT_BUF {
            // Container timestamps anchor H.264-layout blocks exactly; the
            // decoder's block counting must restart per slot.
            if data_type == BufferDataType::H264 {
                sink.reset_block_counters();
            }
            let bucket = &self.buckets[i];
            if bucket.count == 0 {
                continue;
            }
            if bucket.data.get(bucket.count * 3) != Some(&0xFF) {
                // Not optional per the syntax, but the data is still usable.
                debug!(target: "ccdemux::vides", "missing 0xFF marker at end of caption block");
            }
            sink.cc_data(bucket.fts, data_type, &bucket.data[..bucket.count * 3])?;
        }
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::testutil::RecordingSink;

    fn triple(tag: u8) -> [u8; 4] {
        // One tuple plus the trailing sentinel.
        [tag, 0x01, 0x02, 0xFF]
    }

    #[test]
    fn flushes_in_display_order() {
        let mut seq = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        for (s, tag) in [(3, b'A'), (1, b'B'), (2, b'C')] {
            seq.store(
                &mut sink,
                BufferDataType::H264,
                &triple(tag),
                1,
                s,
                MsTime(s as i64 * 100),
                29.97,
            )
            .unwrap();
        }
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        let tags: Vec<u8> = sink.emissions.iter().map(|(_, _, d)| d[0]).collect();
        assert_eq!(tags, vec![b'B', b'C', b'A']);
        // Each slot restored its own timestamp.
        assert_eq!(sink.emissions[0].0, MsTime(100));
        assert_eq!(sink.emissions[2].0, MsTime(300));
        assert!(!seq.has_buffered());
    }

    #[test]
    fn out_of_window_store_flushes_and_reanchors() {
        let mut seq = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        seq.store(&mut sink, BufferDataType::H264, &triple(b'A'), 1, 1, MsTime(0), 30.0)
            .unwrap();
        // Far outside the window: the buffered block comes out first.
        seq.store(
            &mut sink,
            BufferDataType::H264,
            &triple(b'B'),
            1,
            500,
            MsTime(1),
            30.0,
        )
        .unwrap();
        assert_eq!(sink.emissions.len(), 1);
        assert_eq!(sink.emissions[0].2[0], b'A');
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.emissions.len(), 2);
        assert_eq!(sink.emissions[1].2[0], b'B');
    }

    #[test]
    fn append_policy_concatenates() {
        let mut seq = Sequencer::new(StorePolicy::Append, false);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        seq.store(&mut sink, BufferDataType::H264, &triple(b'A'), 1, 0, MsTime(5), 30.0)
            .unwrap();
        seq.store(&mut sink, BufferDataType::H264, &triple(b'B'), 1, 0, MsTime(6), 30.0)
            .unwrap();
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.emissions.len(), 1);
        let (fts, _, data) = &sink.emissions[0];
        assert_eq!(*fts, MsTime(6));
        assert_eq!(data.len(), 6);
        assert_eq!(data[0], b'A');
        assert_eq!(data[3], b'B');
    }

    #[test]
    fn overwrite_policy_replaces() {
        let mut seq = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        seq.store(&mut sink, BufferDataType::H264, &triple(b'A'), 1, 0, MsTime(5), 30.0)
            .unwrap();
        seq.store(&mut sink, BufferDataType::H264, &triple(b'B'), 1, 0, MsTime(6), 30.0)
            .unwrap();
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.emissions.len(), 1);
        assert_eq!(sink.emissions[0].2, vec![b'B', 0x01, 0x02]);
    }

    #[test]
    fn gop_as_pts_recreates_times() {
        let mut seq = Sequencer::new(StorePolicy::Overwrite, true);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        seq.store(&mut sink, BufferDataType::H264, &triple(b'A'), 1, 10, MsTime(0), 25.0)
            .unwrap();
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.emissions[0].0, MsTime(400));
    }

    #[test]
    fn counters_reset_per_slot_for_h264() {
        let mut seq = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        seq.anchor(0);
        seq.store(&mut sink, BufferDataType::H264, &triple(b'A'), 1, 0, MsTime(0), 30.0)
            .unwrap();
        seq.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.counter_resets, SORT_BUF);
        let mut sink = RecordingSink::default();
        seq.store(&mut sink, BufferDataType::Raw, &triple(b'A'), 1, 0, MsTime(0), 30.0)
            .unwrap();
        seq.process(&mut sink, BufferDataType::Raw).unwrap();
        assert_eq!(sink.counter_resets, 0);
    }
}

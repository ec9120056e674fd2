// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HEVC (H.265) caption extraction, see ISO/IEC 23008-2.
//!
//! HEVC shares the SEI caption payload format with AVC; only the NAL framing
//! differs (a two-byte header with a 6-bit type). Slice-header picture-order
//! recovery is not implemented for HEVC, so callers flush the caption buffer
//! at sample boundaries instead of at anchor frames.

use crate::avc::AvcContext;
use crate::caption::{BufferDataType, CaptionSink};
use crate::nal::strip_emulation_prevention;
use crate::sequencer::Sequencer;
use crate::timing::Timing;
use base::Error;
use tracing::{info, trace};

// ISO/IEC 23008-2 table 7-1; VCL types are 0..=31.
pub const NAL_UNIT_VPS: u8 = 32;
pub const NAL_UNIT_SPS: u8 = 33;
pub const NAL_UNIT_PPS: u8 = 34;
pub const NAL_UNIT_ACCESS_UNIT_DELIMITER: u8 = 35;
pub const NAL_UNIT_PREFIX_SEI: u8 = 39;
pub const NAL_UNIT_SUFFIX_SEI: u8 = 40;

/// Returns the 6-bit NAL unit type from the first header byte.
pub fn nal_unit_type(byte0: u8) -> u8 {
    (byte0 >> 1) & 0x3F
}

#[derive(Default)]
pub struct HevcContext {
    pub got_vps: bool,
    pub got_sps: bool,
    pub got_pps: bool,
}

impl HevcContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one HEVC NAL unit (two header bytes first, emulation
    /// prevention still present). Caption bytes accumulate in the shared
    /// caption buffer of `avc`.
    pub fn do_nal(
        &mut self,
        avc: &mut AvcContext,
        nal: &mut [u8],
    ) -> Result<(), Error> {
        if nal.len() < 2 {
            return Ok(());
        }
        let nal_unit_type = nal_unit_type(nal[0]);
        let body_len = match strip_emulation_prevention(&mut nal[2..]) {
            Some(n) => n,
            None => {
                info!(
                    "NAL of type {nal_unit_type} skipped: emulation prevention removal failed"
                );
                return Ok(());
            }
        };
        let body = &nal[2..2 + body_len];
        trace!(
            target: "ccdemux::vides",
            "HEVC NAL unit type {nal_unit_type} length {}",
            body.len()
        );
        match nal_unit_type {
            NAL_UNIT_VPS => self.got_vps = true,
            NAL_UNIT_SPS => self.got_sps = true,
            NAL_UNIT_PPS => self.got_pps = true,
            NAL_UNIT_ACCESS_UNIT_DELIMITER => {}
            NAL_UNIT_PREFIX_SEI | NAL_UNIT_SUFFIX_SEI => {
                avc.sei_rbsp(body)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Sequences whatever the SEI messages of the just-finished sample left
    /// in the caption buffer.
    ///
    /// Without picture-order recovery there is no display-order index to
    /// compute; the sample's own timestamp anchors the block.
    pub fn flush_sample(
        &mut self,
        avc: &mut AvcContext,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
    ) -> Result<(), Error> {
        if avc.cc_count == 0 {
            return Ok(());
        }
        seqr.store(
            sink,
            data_type,
            &avc.cc_data,
            avc.cc_count,
            timing.current_tref,
            timing.fts_now(),
            timing.fps,
        )?;
        avc.cc_data.clear();
        avc.cc_count = 0;
        avc.cc_buffer_saved = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::testutil::RecordingSink;
    use crate::sequencer::StorePolicy;
    use crate::testutil;
    use base::time::{MsTime, Mts};

    #[test]
    fn type_extraction() {
        // Prefix SEI: type 39 -> header byte 0x4E.
        assert_eq!(nal_unit_type(0x4E), NAL_UNIT_PREFIX_SEI);
        assert_eq!(nal_unit_type(0x40), NAL_UNIT_VPS);
        assert_eq!(nal_unit_type(0x42), NAL_UNIT_SPS);
        assert_eq!(nal_unit_type(0x44), NAL_UNIT_PPS);
    }

    #[test]
    fn parameter_sets_recognized() {
        testutil::init();
        let mut hevc = HevcContext::new();
        let mut avc = AvcContext::new();
        for header in [0x40u8, 0x42, 0x44] {
            let mut nal = vec![header, 0x01, 0x11, 0x22];
            hevc.do_nal(&mut avc, &mut nal).unwrap();
        }
        assert!(hevc.got_vps);
        assert!(hevc.got_sps);
        assert!(hevc.got_pps);
    }

    #[test]
    fn prefix_sei_reaches_caption_buffer() {
        testutil::init();
        let mut hevc = HevcContext::new();
        let mut avc = AvcContext::new();
        #[rustfmt::skip]
        let payload = [
            0xB5, 0x00, 0x31,
            b'G', b'A', b'9', b'4',
            0x03, 0x41, 0xFF,
            0xFC, 0x94, 0x2C,
            0xFF,
        ];
        let mut nal = vec![0x4E, 0x01, 0x04, payload.len() as u8];
        nal.extend_from_slice(&payload);
        nal.push(0x80);
        hevc.do_nal(&mut avc, &mut nal).unwrap();
        assert_eq!(avc.cc_count, 1);
        assert_eq!(&avc.cc_data[..3], &[0xFC, 0x94, 0x2C]);
    }

    #[test]
    fn sample_flush_empties_buffer() {
        testutil::init();
        let mut hevc = HevcContext::new();
        let mut avc = AvcContext::new();
        let mut timing = Timing::new(false);
        let mut seqr = Sequencer::new(StorePolicy::Append, false);
        let mut sink = RecordingSink::default();
        avc.cc_data.extend_from_slice(&[0xFC, 0x94, 0x20, 0xFF]);
        avc.cc_count = 1;
        avc.cc_buffer_saved = false;
        timing.set_current_pts(Mts::from_millis(2_000));
        timing.set_fts();
        hevc.flush_sample(&mut avc, &mut timing, &mut seqr, &mut sink, BufferDataType::H264)
            .unwrap();
        assert_eq!(avc.cc_count, 0);
        assert!(avc.cc_buffer_saved);
        seqr.process(&mut sink, BufferDataType::H264).unwrap();
        assert_eq!(sink.emissions.len(), 1);
        assert_eq!(sink.emissions[0].0, MsTime(0));
        assert_eq!(sink.emissions[0].2, vec![0xFC, 0x94, 0x20]);
    }
}

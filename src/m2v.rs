// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG-2 video caption scan, used for `xdvb` MP4 tracks and for DVR-MS
//! video streams that carry ATSC captions in the picture user data.
//!
//! Only the start codes relevant to caption timing are parsed: sequence
//! header (frame rate), GOP header (time code, display-order reset), picture
//! header (temporal reference), and user data. Everything else is skipped.

use crate::caption::{BufferDataType, CaptionSink};
use crate::sequencer::Sequencer;
use crate::timing::Timing;
use base::time::MsTime;
use base::Error;
use serde::Serialize;
use tracing::{debug, info, trace};

const START_CODE_PICTURE: u8 = 0x00;
const START_CODE_USER_DATA: u8 = 0xB2;
const START_CODE_SEQUENCE_HEADER: u8 = 0xB3;
const START_CODE_EXTENSION: u8 = 0xB5;
const START_CODE_GOP: u8 = 0xB8;

const EXTENSION_ID_PICTURE_CODING: u8 = 8;

/// ISO/IEC 13818-2 table 6-4: frame_rate_code to frames per second.
pub const FRAME_RATES: [f64; 9] = [
    0.0,
    24000.0 / 1001.0,
    24.0,
    25.0,
    30000.0 / 1001.0,
    30.0,
    50.0,
    60000.0 / 1001.0,
    60.0,
];

/// User-data varieties seen, for the end-of-file report.
#[derive(Debug, Default, Serialize)]
pub struct UserDataStats {
    pub dvd: u64,
    pub scte20: u64,
    pub replaytv_4000: u64,
    pub replaytv_5000: u64,
    pub hdtv: u64,
    pub dish: u64,
    pub divicom: u64,
    pub false_picture_headers: u64,
    pub pulldown_frames: u64,
}

pub struct M2vContext {
    pub stats: UserDataStats,

    /// Temporal reference of the picture currently being scanned.
    tref: i32,
    in_picture: bool,
    /// Caption tuples collected for the current picture (with sentinel).
    cc_data: Vec<u8>,
    cc_count: usize,

    pub first_gop_time: Option<MsTime>,
    pub last_gop_time: Option<MsTime>,

    reported_unsupported: bool,
}

impl Default for M2vContext {
    fn default() -> Self {
        Self::new()
    }
}

impl M2vContext {
    pub fn new() -> Self {
        M2vContext {
            stats: UserDataStats::default(),
            tref: 0,
            in_picture: false,
            cc_data: Vec::new(),
            cc_count: 0,
            first_gop_time: None,
            last_gop_time: None,
            reported_unsupported: false,
        }
    }

    /// Scans one buffer of MPEG-2 video (an MP4 sample or a PES payload) for
    /// caption user data. The caller has already published the buffer's PTS
    /// through `timing`.
    pub fn process(
        &mut self,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        sink: &mut dyn CaptionSink,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut pos = 0;
        while pos + 4 <= data.len() {
            let Some(off) = memchr::memchr(0x00, &data[pos..data.len() - 3]) else {
                break;
            };
            pos += off;
            if data[pos + 1] != 0x00 || data[pos + 2] != 0x01 {
                pos += 1;
                continue;
            }
            let code = data[pos + 3];
            let payload_start = pos + 4;
            // The payload runs to the next start code (or the end).
            let payload_end = find_next_start_code(data, payload_start);
            match code {
                START_CODE_PICTURE => {
                    self.flush_picture(timing, seqr, sink)?;
                    self.picture_header(timing, &data[payload_start..payload_end]);
                }
                START_CODE_SEQUENCE_HEADER => {
                    self.sequence_header(timing, &data[payload_start..payload_end]);
                }
                START_CODE_GOP => {
                    self.flush_picture(timing, seqr, sink)?;
                    self.gop_header(timing, seqr, sink, &data[payload_start..payload_end])?;
                }
                START_CODE_USER_DATA => {
                    self.user_data(&data[payload_start..payload_end]);
                }
                START_CODE_EXTENSION => {
                    self.extension(&data[payload_start..payload_end]);
                }
                _ => {}
            }
            pos = payload_end;
        }
        self.flush_picture(timing, seqr, sink)?;
        Ok(())
    }

    /// Stores the pending picture's caption bytes at its display order index.
    fn flush_picture(
        &mut self,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        sink: &mut dyn CaptionSink,
    ) -> Result<(), Error> {
        if !self.in_picture {
            return Ok(());
        }
        timing.current_tref = self.tref;
        timing.set_fts();
        if self.cc_count > 0 {
            seqr.store(
                sink,
                BufferDataType::Pes,
                &self.cc_data,
                self.cc_count,
                self.tref,
                timing.fts_now(),
                timing.fps,
            )?;
            self.cc_data.clear();
            self.cc_count = 0;
        }
        self.in_picture = false;
        Ok(())
    }

    fn picture_header(&mut self, _timing: &mut Timing, payload: &[u8]) {
        if payload.len() < 2 {
            self.stats.false_picture_headers += 1;
            return;
        }
        let tref = (u32::from(payload[0]) << 2 | u32::from(payload[1]) >> 6) as i32;
        let coding_type = (payload[1] >> 3) & 0x07;
        // Types beyond B indicate a byte pattern that only looks like a
        // picture start code.
        if !(1..=3).contains(&coding_type) {
            self.stats.false_picture_headers += 1;
            return;
        }
        trace!(target: "ccdemux::vides", "picture: tref {tref} type {coding_type}");
        self.tref = tref;
        self.in_picture = true;
    }

    fn sequence_header(&mut self, timing: &mut Timing, payload: &[u8]) {
        if payload.len() < 4 {
            return;
        }
        let frame_rate_code = (payload[3] & 0x0F) as usize;
        if let Some(&rate) = FRAME_RATES.get(frame_rate_code) {
            if rate > 0.0 && timing.nominal_fps != Some(rate) {
                info!("frame rate {rate} declared by sequence header");
                timing.nominal_fps = Some(rate);
                timing.fps = rate;
            }
        }
    }

    fn gop_header(
        &mut self,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        sink: &mut dyn CaptionSink,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.len() < 4 {
            return Ok(());
        }
        // time_code: drop_frame(1) hours(5) minutes(6) marker(1) seconds(6)
        // pictures(6).
        let tc = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let hours = (tc >> 26) & 0x1F;
        let minutes = (tc >> 20) & 0x3F;
        let seconds = (tc >> 13) & 0x3F;
        let pictures = (tc >> 7) & 0x3F;
        let mut ms =
            i64::from(hours) * 3_600_000 + i64::from(minutes) * 60_000 + i64::from(seconds) * 1_000;
        if timing.fps > 0.0 {
            ms += (f64::from(pictures) * 1000.0 / timing.fps) as i64;
        }
        let gop_time = MsTime(ms);
        debug!(target: "ccdemux::time", "GOP time code {gop_time}");
        if self.first_gop_time.is_none() {
            self.first_gop_time = Some(gop_time);
        }
        self.last_gop_time = Some(gop_time);

        // A GOP restarts the temporal reference count; flush what's buffered
        // and re-anchor.
        if seqr.has_buffered() {
            seqr.process(sink, BufferDataType::Pes)?;
        }
        seqr.anchor(0);
        Ok(())
    }

    /// Classifies a user-data payload and extracts captions from the GA94
    /// (ATSC) and DVD forms.
    fn user_data(&mut self, payload: &[u8]) {
        if payload.len() < 4 {
            return;
        }
        if &payload[..4] == b"GA94" {
            self.stats.hdtv += 1;
            self.atsc_user_data(&payload[4..]);
        } else if payload[..4] == [0x43, 0x43, 0x01, 0xF8] {
            self.stats.dvd += 1;
            self.dvd_user_data(&payload[4..]);
        } else if payload[0] == 0x03 {
            self.stats.scte20 += 1;
            self.report_unsupported("SCTE-20");
        } else if payload[0] == 0xBB && payload[1] == 0x02 {
            self.stats.replaytv_4000 += 1;
            self.report_unsupported("ReplayTV 4000");
        } else if payload[0] == 0x99 && payload[1] == 0x02 {
            self.stats.replaytv_5000 += 1;
            self.report_unsupported("ReplayTV 5000");
        } else if payload[0] == 0x05 && payload[1] == 0x02 {
            self.stats.dish += 1;
            self.report_unsupported("Dish Network");
        } else if &payload[..2] == b"MV" {
            self.stats.divicom += 1;
            self.report_unsupported("Divicom");
        }
    }

    /// Picture coding extension: only `repeat_first_field` matters, to count
    /// 3:2 pulldown frames.
    fn extension(&mut self, payload: &[u8]) {
        if payload.len() < 4 || payload[0] >> 4 != EXTENSION_ID_PICTURE_CODING {
            return;
        }
        if payload[3] & 0x02 != 0 {
            self.stats.pulldown_frames += 1;
        }
    }

    fn report_unsupported(&mut self, variety: &str) {
        if !self.reported_unsupported {
            info!("found {variety} user data; this variety is counted but not decoded");
            self.reported_unsupported = true;
        }
    }

    /// ATSC1_data() inside picture user data: the same cc_data layout as the
    /// AVC SEI carries.
    fn atsc_user_data(&mut self, data: &[u8]) {
        let Some(&user_data_type_code) = data.first() else {
            return;
        };
        if user_data_type_code != 0x03 {
            return;
        }
        let Some(&b) = data.get(1) else {
            return;
        };
        let cc_count = (b & 0x1F) as usize;
        let process_cc_data_flag = (b & 0x40) >> 6;
        if process_cc_data_flag == 0 {
            return;
        }
        let cc_start = 3; // type code + flag byte + em_data
        if cc_start + cc_count * 3 >= data.len() {
            debug!(target: "ccdemux::parse", "truncated GA94 user data");
            return;
        }
        if data[cc_start + cc_count * 3] != 0xFF {
            debug!(target: "ccdemux::parse", "GA94 user data missing 0xFF marker");
            return;
        }
        self.cc_data.truncate(self.cc_count * 3);
        self.cc_data
            .extend_from_slice(&data[cc_start..cc_start + cc_count * 3 + 1]);
        self.cc_count += cc_count;
    }

    /// DVD-style caption user data: field-marker bytes (0xFF odd, 0xFE even)
    /// each followed by a 608 byte pair.
    fn dvd_user_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let cc_count = (data[0] & 0x1F) as usize;
        self.cc_data.truncate(self.cc_count * 3);
        let mut pos = 1;
        let mut added = 0;
        // Two fields per count.
        while added < cc_count * 2 && pos + 3 <= data.len() {
            let marker = data[pos];
            let cc_info = match marker {
                0xFF => 0xFC, // valid, NTSC field 1
                0xFE => 0xFD, // valid, NTSC field 2
                _ => break,
            };
            self.cc_data
                .extend_from_slice(&[cc_info, data[pos + 1], data[pos + 2]]);
            pos += 3;
            added += 1;
        }
        self.cc_data.push(0xFF);
        self.cc_count += added;
    }
}

fn find_next_start_code(data: &[u8], mut from: usize) -> usize {
    while from + 3 <= data.len() {
        match memchr::memchr(0x00, &data[from..data.len().saturating_sub(2)]) {
            None => return data.len(),
            Some(off) => {
                let z = from + off;
                if z + 3 < data.len() && data[z + 1] == 0x00 && data[z + 2] == 0x01 {
                    return z;
                }
                from = z + 1;
            }
        }
    }
    data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::testutil::RecordingSink;
    use crate::sequencer::StorePolicy;
    use crate::testutil;
    use base::time::Mts;

    fn ga94_user_data(cc: &[u8]) -> Vec<u8> {
        let mut ud = vec![0x00, 0x00, 0x01, 0xB2];
        ud.extend_from_slice(b"GA94");
        ud.push(0x03);
        ud.push(0x40 | (cc.len() / 3) as u8);
        ud.push(0xFF); // em_data
        ud.extend_from_slice(cc);
        ud.push(0xFF);
        ud
    }

    fn picture(tref: u16, coding_type: u8) -> Vec<u8> {
        vec![
            0x00,
            0x00,
            0x01,
            0x00,
            (tref >> 2) as u8,
            ((tref as u8 & 0x03) << 6) | (coding_type << 3),
        ]
    }

    #[test]
    fn extracts_ga94_per_picture() {
        testutil::init();
        let mut ctx = M2vContext::new();
        let mut timing = Timing::new(false);
        let mut seqr = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        timing.set_current_pts(Mts::from_millis(1_000));

        let mut sample = Vec::new();
        sample.extend_from_slice(&picture(0, 1)); // I picture
        sample.extend_from_slice(&ga94_user_data(&[0xFC, 0x94, 0x20]));
        sample.extend_from_slice(&picture(2, 3)); // B picture
        sample.extend_from_slice(&ga94_user_data(&[0xFC, 0x94, 0x2C]));
        ctx.process(&mut timing, &mut seqr, &mut sink, &sample).unwrap();

        seqr.process(&mut sink, BufferDataType::Pes).unwrap();
        assert_eq!(sink.emissions.len(), 2);
        // Display order: tref 0 before tref 2.
        assert_eq!(sink.emissions[0].2, vec![0xFC, 0x94, 0x20]);
        assert_eq!(sink.emissions[1].2, vec![0xFC, 0x94, 0x2C]);
        assert_eq!(ctx.stats.hdtv, 2);
    }

    #[test]
    fn gop_header_records_time_and_flushes() {
        testutil::init();
        let mut ctx = M2vContext::new();
        let mut timing = Timing::new(false);
        timing.fps = 25.0;
        let mut seqr = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        timing.set_current_pts(Mts::from_millis(0));

        let mut sample = Vec::new();
        sample.extend_from_slice(&picture(1, 1));
        sample.extend_from_slice(&ga94_user_data(&[0xFC, 0x94, 0x20]));
        // GOP at 00:00:02 + 5 pictures.
        let tc: u32 = (2 << 13) | (5 << 7);
        sample.extend_from_slice(&[0x00, 0x00, 0x01, 0xB8]);
        sample.extend_from_slice(&tc.to_be_bytes());
        ctx.process(&mut timing, &mut seqr, &mut sink, &sample).unwrap();

        // The GOP flushed the buffered picture.
        assert_eq!(sink.emissions.len(), 1);
        assert_eq!(ctx.first_gop_time, Some(MsTime(2_200)));
        assert_eq!(ctx.last_gop_time, Some(MsTime(2_200)));
    }

    #[test]
    fn sequence_header_sets_rate() {
        testutil::init();
        let mut ctx = M2vContext::new();
        let mut timing = Timing::new(false);
        let mut seqr = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        // width/height nibbles then aspect+frame_rate_code byte (code 3 = 25 fps).
        let sample = [0x00, 0x00, 0x01, 0xB3, 0x2D, 0x02, 0x40, 0x33];
        ctx.process(&mut timing, &mut seqr, &mut sink, &sample).unwrap();
        assert_eq!(timing.nominal_fps, Some(25.0));
        assert_eq!(timing.fps, 25.0);
    }

    #[test]
    fn false_picture_header_counted() {
        testutil::init();
        let mut ctx = M2vContext::new();
        let mut timing = Timing::new(false);
        let mut seqr = Sequencer::new(StorePolicy::Overwrite, false);
        let mut sink = RecordingSink::default();
        // coding_type 7 is reserved; this is data that mimics a start code.
        let sample = picture(0, 7);
        let mut padded = sample.clone();
        padded.extend_from_slice(&[0x11, 0x22]);
        ctx.process(&mut timing, &mut seqr, &mut sink, &padded).unwrap();
        assert_eq!(ctx.stats.false_picture_headers, 1);
        assert_eq!(sink.emissions.len(), 0);
    }

    #[test]
    fn pulldown_frames_counted() {
        testutil::init();
        let mut ctx = M2vContext::new();
        // Picture coding extension with repeat_first_field set.
        ctx.extension(&[0x80, 0x00, 0x00, 0x02, 0x00]);
        ctx.extension(&[0x80, 0x00, 0x00, 0x00, 0x00]);
        // A quantizer matrix extension (id 3) is not a picture.
        ctx.extension(&[0x30, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(ctx.stats.pulldown_frames, 1);
    }

    #[test]
    fn dvd_user_data_pairs() {
        testutil::init();
        let mut ctx = M2vContext::new();
        let mut data = vec![0x02]; // two caption "counts" (field pairs follow)
        data.extend_from_slice(&[0xFF, 0x94, 0x20]);
        data.extend_from_slice(&[0xFE, 0x15, 0x2C]);
        ctx.dvd_user_data(&data);
        assert_eq!(ctx.cc_count, 2);
        assert_eq!(
            &ctx.cc_data[..],
            &[0xFC, 0x94, 0x20, 0xFD, 0x15, 0x2C, 0xFF]
        );
    }
}

// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! AVC (H.264) parsing, see ISO/IEC 14496-10.
//!
//! Only the pieces needed to recover caption bytes with correct display-order
//! timing are parsed: the sequence parameter set (for frame-number and
//! picture-order-count field widths plus the VUI frame rate), SEI messages
//! carrying `user_data_registered_itu_t_t35` caption payloads, and slice
//! headers (for the display-order index driving the HDCC sequencer).

use crate::bitstream::BitReader;
use crate::caption::{BufferDataType, CaptionSink};
use crate::nal::strip_emulation_prevention;
use crate::options::Options;
use crate::sequencer::{Sequencer, MAX_B_FRAMES};
use crate::timing::Timing;
use base::time::TIME_UNITS_PER_SEC;
use base::{bail, Error};
use pretty_hex::PrettyHex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

// See ISO/IEC 14496-10 table 7-1.
pub const NAL_UNIT_CODED_SLICE_NON_IDR: u8 = 1;
pub const NAL_UNIT_CODED_SLICE_IDR: u8 = 5;
pub const NAL_UNIT_SEI: u8 = 6;
pub const NAL_UNIT_SEQ_PARAMETER_SET: u8 = 7;
pub const NAL_UNIT_PIC_PARAMETER_SET: u8 = 8;
pub const NAL_UNIT_ACCESS_UNIT_DELIMITER: u8 = 9;

const NAL_UNIT_TYPE_MASK: u8 = 0x1F; // bottom 5 bits of first byte of unit.

/// SEI payload type carrying registered user data (captions).
const SEI_USER_DATA_REGISTERED_ITU_T_T35: usize = 4;

const SLICE_TYPE_NAMES: [&str; 10] = ["P", "B", "I", "SP", "SI", "P", "B", "I", "SP", "SI"];

/// Per-file AVC statistics, folded into the end-of-file report.
#[derive(Debug, Default, Serialize)]
pub struct AvcStats {
    pub num_nal_unit_type_7: u64,
    pub num_nal_hrd: u64,
    pub num_vcl_hrd: u64,
    pub num_jump_in_frames: u64,
    pub num_unexpected_sei_length: u64,
    pub ccblocks_total: u64,
    pub ccblocks_lost: u64,
}

/// State of the AVC caption extractor, alive for the decoded stream.
pub struct AvcContext {
    /// Caption tuples recovered from SEI messages, plus a trailing 0xFF
    /// sentinel, waiting for the next slice header to be sequenced.
    pub(crate) cc_data: Vec<u8>,
    pub(crate) cc_count: usize,
    /// Whether the buffer reached the sequencer since it was last extended.
    pub(crate) cc_buffer_saved: bool,

    pub(crate) got_seq_para: bool,
    pub(crate) nal_ref_idc: u8,
    pub(crate) seq_parameter_set_id: u64,
    pub(crate) log2_max_frame_num: u32,
    pub(crate) pic_order_cnt_type: u64,
    pub(crate) log2_max_pic_order_cnt_lsb: u32,
    pub(crate) frame_mbs_only_flag: bool,

    pub(crate) frame_num: i64,
    pub(crate) lastframe_num: i64,

    /// Display-order reference of the current GOP's anchor.
    pub(crate) currref: i32,
    pub(crate) maxidx: i32,
    pub(crate) lastmaxidx: i32,
    // Used to find tref zero in PTS mode.
    pub(crate) minidx: i32,
    pub(crate) lastminidx: i32,
    // Maximum temporal reference of the current/previous GOP (POC mode).
    pub(crate) maxtref: i32,
    pub(crate) last_gop_maxtref: i32,
    // Anchor PTS for PTS-mode ordering of CC blocks.
    pub(crate) currefpts: i64,

    pub(crate) last_pic_order_cnt_lsb: i64,
    pub(crate) last_slice_pts: i64,

    pub(crate) frames_since_last_gop: u32,
    pub(crate) last_gop_length: u32,
    pub(crate) total_frames: u64,

    pub stats: AvcStats,
}

impl Default for AvcContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AvcContext {
    pub fn new() -> Self {
        AvcContext {
            cc_data: Vec::with_capacity(1024),
            cc_count: 0,
            cc_buffer_saved: true,
            got_seq_para: false,
            nal_ref_idc: 0,
            seq_parameter_set_id: 0,
            log2_max_frame_num: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb: 0,
            frame_mbs_only_flag: false,
            frame_num: -1,
            lastframe_num: -1,
            currref: 0,
            maxidx: -1,
            lastmaxidx: -1,
            minidx: 10000,
            lastminidx: 10000,
            maxtref: 0,
            last_gop_maxtref: 0,
            currefpts: 0,
            last_pic_order_cnt_lsb: -1,
            last_slice_pts: -1,
            frames_since_last_gop: 0,
            last_gop_length: 0,
            total_frames: 0,
            stats: AvcStats::default(),
        }
    }

    /// Handles one NAL unit (header byte first, emulation prevention still
    /// present; it is stripped in place here).
    pub fn do_nal(
        &mut self,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        opts: &Options,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
        nal: &mut [u8],
    ) -> Result<(), Error> {
        if nal.is_empty() {
            return Ok(());
        }
        let nal_unit_type = nal[0] & NAL_UNIT_TYPE_MASK;
        self.nal_ref_idc = nal[0] >> 5;

        let body_len = match strip_emulation_prevention(&mut nal[1..]) {
            Some(n) => n,
            None => {
                info!(
                    "NAL of type {nal_unit_type} skipped: emulation prevention removal failed"
                );
                return Ok(());
            }
        };
        let body = &nal[1..1 + body_len];
        trace!(
            target: "ccdemux::vides",
            "NAL unit type {nal_unit_type} length {} ref_idc {} buffered captions: {}",
            body.len(),
            self.nal_ref_idc,
            !self.cc_buffer_saved,
        );

        match nal_unit_type {
            NAL_UNIT_ACCESS_UNIT_DELIMITER => {}
            NAL_UNIT_SEQ_PARAMETER_SET => {
                // Needed before slices and SEI can be interpreted.
                self.stats.num_nal_unit_type_7 += 1;
                self.seq_parameter_set(timing, body);
                self.got_seq_para = true;
            }
            NAL_UNIT_CODED_SLICE_NON_IDR | NAL_UNIT_CODED_SLICE_IDR if self.got_seq_para => {
                // Only the slice header is needed, to recover display order.
                self.slice_header(timing, seqr, opts, sink, data_type, nal_unit_type, body)?;
            }
            NAL_UNIT_SEI if self.got_seq_para => {
                self.sei_rbsp(body)?;
            }
            NAL_UNIT_PIC_PARAMETER_SET if self.got_seq_para => {}
            _ => {}
        }
        Ok(())
    }

    /// Processes SEI messages plus the trailing `rbsp_trailing_bits`.
    pub(crate) fn sei_rbsp(&mut self, body: &[u8]) -> Result<(), Error> {
        if body.is_empty() {
            self.stats.num_unexpected_sei_length += 1;
            return Ok(());
        }
        // The final byte is the rbsp trailing marker.
        let limit = body.len() - 1;
        let mut pos = 0;
        while pos < limit {
            pos = self.sei_message(body, pos, limit)?;
        }
        if pos == limit {
            if body[limit] != 0x80 {
                info!("strange rbsp_trailing_bits value: {:02X}", body[limit]);
            }
        } else {
            warn!("unexpected SEI unit length, trying to continue");
            debug!(target: "ccdemux::vides", "failed SEI unit:\n{:?}", body.hex_dump());
            self.stats.num_unexpected_sei_length += 1;
        }
        Ok(())
    }

    /// Reads one SEI message starting at `pos`; returns the position after
    /// its payload (which may overrun `limit`; the caller treats that as an
    /// unexpected length).
    fn sei_message(&mut self, body: &[u8], mut pos: usize, limit: usize) -> Result<usize, Error> {
        let mut payload_type = 0usize;
        while pos < limit && body[pos] == 0xFF {
            payload_type += 255;
            pos += 1;
        }
        if pos >= limit {
            return Ok(limit + 1);
        }
        payload_type += body[pos] as usize;
        pos += 1;

        let mut payload_size = 0usize;
        while pos < limit && body[pos] == 0xFF {
            payload_size += 255;
            pos += 1;
        }
        if pos >= limit {
            return Ok(limit + 1);
        }
        payload_size += body[pos] as usize;
        pos += 1;

        let payload_start = pos;
        let payload_end = pos + payload_size;
        trace!(target: "ccdemux::vides", "SEI payload type {payload_type} size {payload_size}");
        if payload_end > limit {
            // Tolerated; the enclosing sei_rbsp logs and counts it.
            debug!(
                target: "ccdemux::verbose",
                "SEI payload of type {payload_type} overruns the unit, continuing"
            );
            return Ok(payload_end);
        }
        if payload_type == SEI_USER_DATA_REGISTERED_ITU_T_T35 {
            self.user_data_registered_itu_t_t35(&body[payload_start..payload_end])?;
        }
        Ok(payload_end)
    }

    /// Extracts `cc_data` from a `user_data_registered_itu_t_t35` payload.
    ///
    /// Two layouts appear in the wild, both with country code 0xB5: ANSI/SCTE
    /// 128 (provider 0x0031, an ATSC1_data `GA94` wrapper), and the older
    /// provider 0x002F layout with an explicit user_data_len.
    pub(crate) fn user_data_registered_itu_t_t35(&mut self, user: &[u8]) -> Result<(), Error> {
        if user.len() < 3 {
            self.stats.num_unexpected_sei_length += 1;
            return Ok(());
        }
        let country_code = user[0];
        let provider_code = u16::from(user[1]) << 8 | u16::from(user[2]);
        if country_code != 0xB5 {
            info!("unsupported user data SEI, itu_t_t35_country_code {country_code:02x}");
            return Ok(());
        }
        let mut pos = 3;
        match provider_code {
            0x0031 => {
                // ANSI/SCTE 128
                debug!(target: "ccdemux::verbose", "caption block in ANSI/SCTE 128");
                if user.len() >= pos + 4 && &user[pos..pos + 4] == b"GA94" {
                    // ATSC1_data()
                    pos += 4;
                    let Some(&user_data_type_code) = user.get(pos) else {
                        self.stats.num_unexpected_sei_length += 1;
                        return Ok(());
                    };
                    pos += 1;
                    match user_data_type_code {
                        0x03 => {
                            let Some(&b) = user.get(pos) else {
                                self.stats.num_unexpected_sei_length += 1;
                                return Ok(());
                            };
                            let cc_count = (b & 0x1F) as usize;
                            let _process_cc_data_flag = (b & 0x40) >> 6;
                            // Flag byte plus the em_data byte.
                            pos += 2;
                            if pos + cc_count * 3 >= user.len() {
                                bail!(
                                    DataLoss,
                                    msg("syntax problem: too many caption blocks in SEI")
                                );
                            }
                            if user[pos + cc_count * 3] != 0xFF {
                                warn!("syntax problem: final 0xFF marker missing, continuing");
                                return Ok(());
                            }
                            self.append_cc_data(&user[pos..pos + cc_count * 3 + 1], cc_count);
                        }
                        0x06 => {
                            debug!(target: "ccdemux::verbose", "bar_data (unsupported)");
                        }
                        _ => {
                            debug!(target: "ccdemux::verbose", "SCTE/ATSC reserved");
                        }
                    }
                } else if user.len() >= pos + 4 && &user[pos..pos + 4] == b"DTG1" {
                    // Active Format Description data; unrelated to captions.
                } else {
                    debug!(target: "ccdemux::verbose", "SCTE/ATSC reserved");
                }
            }
            0x002F => {
                let Some(&user_data_type_code) = user.get(pos) else {
                    self.stats.num_unexpected_sei_length += 1;
                    return Ok(());
                };
                if user_data_type_code != 0x03 {
                    debug!(
                        target: "ccdemux::verbose",
                        "unsupported user_data_type_code {user_data_type_code:02x}"
                    );
                    return Ok(());
                }
                pos += 1;
                let (Some(&user_data_len), Some(&b)) = (user.get(pos), user.get(pos + 1)) else {
                    self.stats.num_unexpected_sei_length += 1;
                    return Ok(());
                };
                pos += 1;
                let cc_count = (b & 0x1F) as usize;
                let process_cc_data_flag = (b & 0x40) >> 6;
                if process_cc_data_flag == 0 {
                    info!("process_cc_data_flag == 0, skipping this caption block");
                    return Ok(());
                }
                let cc_start = pos + 2;
                if cc_count * 3 + 3 != user_data_len as usize {
                    bail!(
                        DataLoss,
                        msg("syntax problem: user_data_len != cc_count*3+3")
                    );
                }
                if cc_start + cc_count * 3 >= user.len() {
                    bail!(DataLoss, msg("syntax problem: too many caption blocks in SEI"));
                }
                if user[cc_start + cc_count * 3] != 0xFF {
                    bail!(DataLoss, msg("syntax problem: final 0xFF marker missing"));
                }
                self.append_cc_data(&user[cc_start..cc_start + cc_count * 3 + 1], cc_count);
            }
            _ => {
                info!("unsupported user data SEI, itu_t_35_provider_code {provider_code:04x}");
            }
        }
        Ok(())
    }

    /// Appends tuples (including the source's trailing sentinel) to the CC
    /// buffer. Appending onto a buffer that was never sequenced means the
    /// previous slice header went missing and captions are being lost.
    pub(crate) fn append_cc_data(&mut self, source: &[u8], new_cc_count: usize) {
        self.stats.ccblocks_total += 1;
        if !self.cc_buffer_saved {
            warn!("probable loss of CC data: unsequenced caption buffer is being extended");
            self.stats.ccblocks_lost += 1;
        }
        self.cc_data.truncate(self.cc_count * 3);
        self.cc_data.extend_from_slice(source);
        self.cc_count += new_cc_count;
        self.cc_buffer_saved = false;
    }

    /// Parses a sequence parameter set; see ISO/IEC 14496-10 section 7.3.2.1.
    pub(crate) fn seq_parameter_set(&mut self, timing: &mut Timing, body: &[u8]) {
        let mut r = BitReader::new(body);
        let profile_idc = r.read_bits(8);
        r.skip_bits(8); // constraint flags + reserved
        r.skip_bits(8); // level_idc
        self.seq_parameter_set_id = r.read_exp_golomb_unsigned();
        trace!(
            target: "ccdemux::vides",
            "SPS: profile_idc {profile_idc} id {}",
            self.seq_parameter_set_id
        );
        if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128) {
            let chroma_format_idc = r.read_exp_golomb_unsigned();
            if chroma_format_idc == 3 {
                r.skip_bits(1); // separate_colour_plane_flag
            }
            r.read_exp_golomb_unsigned(); // bit_depth_luma_minus8
            r.read_exp_golomb_unsigned(); // bit_depth_chroma_minus8
            r.skip_bits(1); // qpprime_y_zero_transform_bypass_flag
            if r.read_bits(1) == 1 {
                // seq_scaling_matrix_present_flag: consume the scaling lists
                // without keeping them (section 7.3.2.1.1.1).
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    if r.read_bits(1) == 1 {
                        let size = if i < 6 { 16 } else { 64 };
                        let mut next_scale = 8i64;
                        let mut last_scale = 8i64;
                        for _ in 0..size {
                            if next_scale != 0 {
                                let delta_scale = r.read_exp_golomb();
                                next_scale = (last_scale + delta_scale + 256) % 256;
                            }
                            last_scale = if next_scale == 0 { last_scale } else { next_scale };
                        }
                    }
                }
            }
        }
        self.log2_max_frame_num = r.read_exp_golomb_unsigned() as u32 + 4;
        self.pic_order_cnt_type = r.read_exp_golomb_unsigned();
        if self.pic_order_cnt_type == 0 {
            self.log2_max_pic_order_cnt_lsb = r.read_exp_golomb_unsigned() as u32 + 4;
        } else if self.pic_order_cnt_type == 1 {
            r.skip_bits(1); // delta_pic_order_always_zero_flag
            r.read_exp_golomb(); // offset_for_non_ref_pic
            r.read_exp_golomb(); // offset_for_top_to_bottom_field
            let cycle = r.read_exp_golomb_unsigned();
            for _ in 0..cycle {
                r.read_exp_golomb(); // offset_for_ref_frame
            }
        }
        // Nothing needs to be parsed when pic_order_cnt_type == 2.

        r.read_exp_golomb_unsigned(); // max_num_ref_frames
        r.skip_bits(1); // gaps_in_frame_num_value_allowed_flag
        r.read_exp_golomb_unsigned(); // pic_width_in_mbs_minus1
        r.read_exp_golomb_unsigned(); // pic_height_in_map_units_minus1
        self.frame_mbs_only_flag = r.read_bits(1) == 1;
        if !self.frame_mbs_only_flag {
            r.skip_bits(1); // mb_adaptive_frame_field_flag
        }
        r.skip_bits(1); // direct_8x8_inference_flag
        if r.read_bits(1) == 1 {
            // frame_cropping_flag
            r.read_exp_golomb_unsigned();
            r.read_exp_golomb_unsigned();
            r.read_exp_golomb_unsigned();
            r.read_exp_golomb_unsigned();
        }
        if r.read_bits(1) == 1 {
            self.vui_parameters(timing, &mut r);
        }
        trace!(
            target: "ccdemux::vides",
            "SPS: log2_max_frame_num {} pic_order_cnt_type {} log2_max_pic_order_cnt_lsb {} \
             frame_mbs_only {}",
            self.log2_max_frame_num,
            self.pic_order_cnt_type,
            self.log2_max_pic_order_cnt_lsb,
            self.frame_mbs_only_flag,
        );
    }

    fn vui_parameters(&mut self, timing: &mut Timing, r: &mut BitReader) {
        if r.read_bits(1) == 1 {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = r.read_bits(8);
            if aspect_ratio_idc == 255 {
                r.skip_bits(32); // sar_width + sar_height
            }
        }
        if r.read_bits(1) == 1 {
            r.skip_bits(1); // overscan_appropriate_flag
        }
        if r.read_bits(1) == 1 {
            // video_signal_type_present_flag
            r.skip_bits(4); // video_format + video_full_range_flag
            if r.read_bits(1) == 1 {
                r.skip_bits(24); // colour description
            }
        }
        if r.read_bits(1) == 1 {
            // chroma_loc_info_present_flag
            r.read_exp_golomb_unsigned();
            r.read_exp_golomb_unsigned();
        }
        if r.read_bits(1) == 1 {
            // timing_info_present_flag
            let num_units_in_tick = r.read_bits(32);
            let time_scale = r.read_bits(32);
            let fixed_frame_rate_flag = r.read_bits(1);
            // Formula D-2, ISO/IEC 14496-10:2012(E) page 359.
            if fixed_frame_rate_flag == 1 && num_units_in_tick > 0 {
                let fps = time_scale as f64 / (2 * num_units_in_tick) as f64;
                if timing.fps != fps {
                    timing.fps = fps;
                    info!("changed fps using NAL to {fps}");
                }
            }
        }
        // HRD parameters are not decoded; record the encounter and stop.
        if r.read_bits(1) == 1 {
            debug!(target: "ccdemux::vides", "nal_hrd parameters present, skipping rest of SPS");
            self.stats.num_nal_hrd += 1;
            return;
        }
        if r.read_bits(1) == 1 {
            debug!(target: "ccdemux::vides", "vcl_hrd parameters present, skipping rest of SPS");
            self.stats.num_vcl_hrd += 1;
            r.skip_bits(1); // low_delay_hrd_flag
            return;
        }
        r.skip_bits(1); // pic_struct_present_flag
        r.skip_bits(1); // bitstream_restriction_flag
        // The GOP length might be in max_dec_frame_buffering, but it's not
        // set in practice; the rest is not needed.
    }

    /// Parses a slice header and sequences the buffered caption bytes at the
    /// slice's display-order index.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn slice_header(
        &mut self,
        timing: &mut Timing,
        seqr: &mut Sequencer,
        opts: &Options,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
        nal_unit_type: u8,
        body: &[u8],
    ) -> Result<(), Error> {
        let mut r = BitReader::new(body);

        r.read_exp_golomb_unsigned(); // first_mb_in_slice
        let slice_type = r.read_exp_golomb_unsigned();
        r.read_exp_golomb_unsigned(); // pic_parameter_set_id

        self.lastframe_num = self.frame_num;
        let max_frame_num = (1i64 << self.log2_max_frame_num) - 1;
        self.frame_num = r.read_bits(self.log2_max_frame_num) as i64;

        if !self.frame_mbs_only_flag && r.read_bits(1) == 1 {
            // field_pic_flag set: the video is interlaced, so the
            // container-declared frame rate overrides the VUI-derived one.
            r.skip_bits(1); // bottom_field_flag
            if let Some(rate) = timing.nominal_fps {
                timing.fps = rate;
            }
        }

        if nal_unit_type == NAL_UNIT_CODED_SLICE_IDR {
            r.read_exp_golomb_unsigned(); // idr_pic_id
        }
        let mut pic_order_cnt_lsb: i64 = -1;
        if self.pic_order_cnt_type == 0 {
            pic_order_cnt_lsb = r.read_bits(self.log2_max_pic_order_cnt_lsb) as i64;
        }
        if self.pic_order_cnt_type == 1 {
            bail!(Unimplemented, msg("AVC pic_order_cnt_type == 1 is not supported"));
        }
        if r.had_error() {
            debug!(target: "ccdemux::vides", "skipping truncated slice header");
            return Ok(());
        }

        // Ignore a repeated slice of the same picture.
        if opts.use_pic_order {
            if self.last_pic_order_cnt_lsb == pic_order_cnt_lsb {
                return Ok(());
            }
            self.last_pic_order_cnt_lsb = pic_order_cnt_lsb;
        } else {
            if timing.current_pts.0 == self.last_slice_pts {
                return Ok(());
            }
            self.last_slice_pts = timing.current_pts.0;
        }
        // The rest of the data in slice_header() is unused.

        // A reference pic (I or P) is always the last displayed picture of a
        // POC sequence. B slices can be reference pics too, so nal_ref_idc is
        // no help here.
        let mut isref = matches!(slice_type, 0 | 5 | 2 | 7);

        let maxrefcnt = ((1i64 << self.log2_max_pic_order_cnt_lsb) - 1) as i32;

        // On a frame-number discontinuity, invalidate the index state so tref
        // is not computed across the gap.
        let mut dif = self.frame_num - self.lastframe_num;
        if dif == -max_frame_num {
            dif = 0;
        }
        if self.lastframe_num > -1 && !(0..=1).contains(&dif) {
            self.stats.num_jump_in_frames += 1;
            debug!(
                target: "ccdemux::vides",
                "jump in frame numbers ({}/{})",
                self.frame_num,
                self.lastframe_num
            );
            self.maxidx = -1;
            self.lastmaxidx = -1;
        }

        // Sometimes P-slices follow each other closely; only treat the first
        // as a reference pic.
        if isref && self.frames_since_last_gop <= 3 {
            isref = false;
            debug!(target: "ccdemux::time", "ignoring this reference pic");
        }

        if isref {
            debug!(
                target: "ccdemux::time",
                "reference pic [{}] maxrefcnt: {maxrefcnt}",
                SLICE_TYPE_NAMES.get(slice_type as usize).unwrap_or(&"?"),
            );
            if seqr.has_buffered() {
                seqr.process(sink, data_type)?;
            }
            self.last_gop_length = self.frames_since_last_gop;
            self.frames_since_last_gop = 0;
            self.last_gop_maxtref = self.maxtref;
            self.maxtref = 0;
            self.lastmaxidx = self.maxidx;
            self.maxidx = 0;
            self.lastminidx = self.minidx;
            self.minidx = 10000;

            if opts.use_pic_order {
                // Make sure current_index never wraps for values smaller
                // than currref.
                self.currref = pic_order_cnt_lsb as i32;
                if self.currref < maxrefcnt / 3 {
                    self.currref += maxrefcnt + 1;
                }
                // If we wrapped around, lastmaxidx might be larger than the
                // current index.
                if self.lastmaxidx > self.currref + maxrefcnt / 2 {
                    self.lastmaxidx -= maxrefcnt + 1;
                }
            } else {
                self.currefpts = timing.current_pts.0;
                self.currref = 0;
            }
            seqr.anchor(self.currref);
        }

        let current_index;
        if opts.use_pic_order {
            // Wrap (add the max index value) if needed.
            if self.currref - (pic_order_cnt_lsb as i32) > maxrefcnt / 2 {
                current_index = pic_order_cnt_lsb as i32 + maxrefcnt + 1;
            } else {
                current_index = pic_order_cnt_lsb as i32;
            }
            if current_index > self.maxidx {
                self.maxidx = current_index;
            }
            if self.lastmaxidx > 0 {
                let mut tref = current_index - self.lastmaxidx - 1;
                if tref > self.maxtref {
                    self.maxtref = tref;
                }
                // Workaround for streams where pic_order_cnt_lsb increases in
                // steps of two. The 1.5 approximates
                // last_gop_maxtref+1 == last_gop_length*2.
                if self.last_gop_maxtref as f64 > self.last_gop_length as f64 * 1.5 {
                    tref /= 2;
                }
                timing.current_tref = tref;
            } else {
                timing.current_tref = 0;
            }
            if timing.current_tref < 0 {
                info!("current_tref is negative!?");
            }
        } else {
            // Index from the PTS difference and frame rate. The 2x accounts
            // for a discrepancy between declared and actual FPS seen in some
            // files.
            let delta = (timing.current_pts.0 - self.currefpts) as f64;
            let mut index =
                (2.0 * delta / (TIME_UNITS_PER_SEC as f64 / timing.fps)).round() as i32;
            if index.abs() >= MAX_B_FRAMES {
                // Probably a jump in the timeline.
                info!("found large gap ({index}) in PTS, trying to recover");
                index = 0;
            }
            if index > self.maxidx {
                self.maxidx = index;
            }
            if index < self.minidx {
                self.minidx = index;
            }
            timing.current_tref = 1;
            if index == self.lastminidx {
                // The minimal index sets the temporal reference to zero.
                timing.current_tref = 0;
            }
            if self.lastmaxidx == -1 {
                // First GOP: avoid setting a wrong fts offset.
                timing.current_tref = 0;
            }
            current_index = index;
        }

        timing.set_fts();

        debug!(
            target: "ccdemux::time",
            "picordercnt {pic_order_cnt_lsb} tref {} idx {current_index} refidx {} \
             lmaxidx {} maxtref {} {} since GOP {} frame# {}",
            timing.current_tref,
            self.currref,
            self.lastmaxidx,
            self.maxtref,
            SLICE_TYPE_NAMES.get(slice_type as usize).unwrap_or(&"?"),
            self.frames_since_last_gop,
            self.frame_num,
        );

        self.total_frames += 1;
        self.frames_since_last_gop += 1;

        seqr.store(
            sink,
            data_type,
            &self.cc_data,
            self.cc_count,
            current_index,
            timing.fts_now(),
            timing.fps,
        )?;
        self.cc_data.clear();
        self.cc_count = 0;
        self.cc_buffer_saved = true;
        Ok(())
    }
}

/// Walks an Annex B buffer and feeds each NAL unit through [`AvcContext::do_nal`].
/// Returns the number of bytes processed (always the whole buffer).
#[allow(clippy::too_many_arguments)]
pub fn process_avc_stream(
    avc: &mut AvcContext,
    timing: &mut Timing,
    seqr: &mut Sequencer,
    opts: &Options,
    sink: &mut dyn CaptionSink,
    data_type: BufferDataType,
    buf: &mut [u8],
) -> Result<usize, Error> {
    crate::nal::each_nal_unit(buf, |nal| {
        avc.do_nal(timing, seqr, opts, sink, data_type, nal)
    })?;
    Ok(buf.len())
}

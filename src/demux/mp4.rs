// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MP4 / ISO-BMFF caption extraction.
//!
//! The `moov` box is read into memory and its sample tables
//! (`stts`/`ctts`/`stsc`/`stsz`/`stco`) are walked to visit every sample of
//! every track with its decode time, composition offset, and file position.
//! Tracks are dispatched on their (handler, sample-entry) pair: AVC/HEVC
//! video (captions in SEI), `xdvb` MPEG-2 video (captions in user data),
//! `c608`/`c708` caption tracks, and `tx3g` timed text.

use crate::caption::{BufferDataType, CaptionSink, CcTriple};
use crate::demux::Pipeline;
use base::shutdown;
use base::time::{MsTime, TIME_UNITS_PER_SEC};
use base::{bail, err, Error};
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, info, warn};

/// Caption Distribution Packet section ids (SMPTE 334-2).
const CDP_MAGIC: u16 = 0x9669;
const CDP_SECTION_DATA: u8 = 0x72;
const CDP_SECTION_SVC_INFO: u8 = 0x73;
const CDP_SECTION_FOOTER: u8 = 0x74;

/// Guard against absurd `moov` sizes before buffering one in memory.
const MAX_MOOV_SIZE: u64 = 1 << 28;

#[derive(Copy, Clone, Debug, Default)]
struct SampleSizes {
    default: u32,
    count: u32,
}

#[derive(Copy, Clone, Debug)]
struct StscEntry {
    first_chunk: u32,
    samples_per_chunk: u32,
    sample_description_index: u32,
}

/// One track's identity and sample tables.
pub struct Track {
    pub id: u32,
    pub handler: [u8; 4],
    /// 4CC of the first sample description entry.
    pub subtype: [u8; 4],
    pub timescale: u32,
    /// Length of the per-NAL size prefix (from `avcC`/`hvcC`).
    pub nal_unit_size: u8,
    /// Parameter set NAL units from the decoder configuration.
    pub param_sets: Vec<Vec<u8>>,

    stts: Vec<(u32, u32)>,
    ctts: Vec<(u32, i32)>,
    stsc: Vec<StscEntry>,
    sizes: SampleSizes,
    explicit_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
}

impl Track {
    fn new() -> Self {
        Track {
            id: 0,
            handler: [0; 4],
            subtype: [0; 4],
            timescale: 0,
            nal_unit_size: 4,
            param_sets: Vec::new(),
            stts: Vec::new(),
            ctts: Vec::new(),
            stsc: Vec::new(),
            sizes: SampleSizes::default(),
            explicit_sizes: Vec::new(),
            chunk_offsets: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.sizes.count
    }

    fn sample_size(&self, i: u32) -> u32 {
        if self.sizes.default != 0 {
            self.sizes.default
        } else {
            self.explicit_sizes.get(i as usize).copied().unwrap_or(0)
        }
    }

    /// Walks the sample tables in decode order.
    pub fn samples(&self) -> SampleIter<'_> {
        SampleIter {
            t: self,
            i: 0,
            dts: 0,
            stts_i: 0,
            stts_used: 0,
            ctts_i: 0,
            ctts_used: 0,
            stsc_i: 0,
            chunk: self.stsc.first().map(|e| e.first_chunk).unwrap_or(1),
            in_chunk: 0,
            chunk_pos: 0,
        }
    }

    /// PTS of a sample in 90 kHz units: `(DTS + CTS offset)` rescaled.
    pub fn sample_pts(&self, s: &Sample) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (s.dts as i64 + i64::from(s.cts_offset)) * TIME_UNITS_PER_SEC / i64::from(self.timescale)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    pub dts: u64,
    pub cts_offset: i32,
    pub size: u32,
    pub offset: u64,
    pub sample_description_index: u32,
}

pub struct SampleIter<'a> {
    t: &'a Track,
    i: u32,
    dts: u64,
    stts_i: usize,
    stts_used: u32,
    ctts_i: usize,
    ctts_used: u32,
    stsc_i: usize,
    chunk: u32,
    in_chunk: u32,
    chunk_pos: u64,
}

impl Iterator for SampleIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.i >= self.t.sizes.count || self.t.stsc.is_empty() {
            return None;
        }
        // Move to the next chunk when this one's samples are used up.
        if self.in_chunk == self.t.stsc[self.stsc_i].samples_per_chunk {
            self.chunk += 1;
            self.in_chunk = 0;
            self.chunk_pos = 0;
            if let Some(next) = self.t.stsc.get(self.stsc_i + 1) {
                if self.chunk >= next.first_chunk {
                    self.stsc_i += 1;
                }
            }
        }
        let chunk_offset = self
            .t
            .chunk_offsets
            .get(self.chunk as usize - 1)
            .copied()?;
        let size = self.t.sample_size(self.i);
        let cts_offset = match self.t.ctts.get(self.ctts_i) {
            Some(&(_, off)) => off,
            None => 0,
        };
        let s = Sample {
            dts: self.dts,
            cts_offset,
            size,
            offset: chunk_offset + self.chunk_pos,
            sample_description_index: self.t.stsc[self.stsc_i].sample_description_index,
        };

        // Advance decode time.
        if let Some(&(count, delta)) = self.t.stts.get(self.stts_i) {
            self.dts += u64::from(delta);
            self.stts_used += 1;
            if self.stts_used == count {
                self.stts_i += 1;
                self.stts_used = 0;
            }
        }
        if let Some(&(count, _)) = self.t.ctts.get(self.ctts_i) {
            self.ctts_used += 1;
            if self.ctts_used == count {
                self.ctts_i += 1;
                self.ctts_used = 0;
            }
        }
        self.chunk_pos += u64::from(size);
        self.in_chunk += 1;
        self.i += 1;
        Some(s)
    }
}

#[derive(Debug, Serialize)]
pub struct Chapter {
    pub time: MsTime,
    pub name: String,
}

pub struct Mp4File {
    pub tracks: Vec<Track>,
    pub chapters: Vec<Chapter>,
}

/// Iterates over the boxes of an in-memory buffer, yielding (type, body).
struct Boxes<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Boxes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Boxes { buf, pos: 0 }
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let hdr = self.buf.get(self.pos..self.pos + 8)?;
        let mut size = u64::from(BigEndian::read_u32(&hdr[..4]));
        let typ: [u8; 4] = hdr[4..8].try_into().unwrap();
        let mut body_start = self.pos + 8;
        if size == 1 {
            let large = self.buf.get(self.pos + 8..self.pos + 16)?;
            size = BigEndian::read_u64(large);
            body_start = self.pos + 16;
        } else if size == 0 {
            size = (self.buf.len() - self.pos) as u64;
        }
        if size < (body_start - self.pos) as u64 {
            return None;
        }
        let end = self.pos + size as usize;
        let body = self.buf.get(body_start..end)?;
        self.pos = end;
        Some((typ, body))
    }
}

impl Mp4File {
    /// Reads the box structure of the file, buffering `moov` for table
    /// parsing and skipping media data.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Mp4File, Error> {
        let mut file = Mp4File {
            tracks: Vec::new(),
            chapters: Vec::new(),
        };
        r.seek(SeekFrom::Start(0))?;
        loop {
            let mut hdr = [0u8; 8];
            if !read_exact_or_eof(r, &mut hdr)? {
                break;
            }
            let mut size = u64::from(BigEndian::read_u32(&hdr[..4]));
            let typ: [u8; 4] = hdr[4..8].try_into().unwrap();
            let mut header_len = 8u64;
            if size == 1 {
                let mut large = [0u8; 8];
                if !read_exact_or_eof(r, &mut large)? {
                    break;
                }
                size = BigEndian::read_u64(&large);
                header_len = 16;
            }
            if size == 0 {
                // Box extends to end of file; nothing there we need.
                break;
            }
            if size < header_len {
                bail!(DataLoss, msg("MP4 box smaller than its header"));
            }
            let body_len = size - header_len;
            if &typ == b"moov" {
                if body_len > MAX_MOOV_SIZE {
                    bail!(ResourceExhausted, msg("MP4 moov box is implausibly large"));
                }
                let mut body = vec![0u8; body_len as usize];
                if !read_exact_or_eof(r, &mut body)? {
                    bail!(DataLoss, msg("truncated moov box"));
                }
                file.parse_moov(&body)?;
            } else {
                r.seek(SeekFrom::Current(body_len as i64))?;
            }
        }
        Ok(file)
    }

    fn parse_moov(&mut self, moov: &[u8]) -> Result<(), Error> {
        for (typ, body) in Boxes::new(moov) {
            match &typ {
                b"trak" => {
                    let track = parse_trak(body)?;
                    debug!(
                        target: "ccdemux::parse",
                        "track {}: handler {} subtype {} timescale {} samples {}",
                        track.id,
                        String::from_utf8_lossy(&track.handler),
                        String::from_utf8_lossy(&track.subtype),
                        track.timescale,
                        track.sample_count(),
                    );
                    self.tracks.push(track);
                }
                b"udta" => {
                    for (t, b) in Boxes::new(body) {
                        if &t == b"chpl" {
                            self.chapters = parse_chpl(b);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            return Ok(false);
        }
        total += n;
    }
    Ok(true)
}

fn parse_trak(trak: &[u8]) -> Result<Track, Error> {
    let mut t = Track::new();
    for (typ, body) in Boxes::new(trak) {
        match &typ {
            b"tkhd" => {
                let version = body.first().copied().unwrap_or(0);
                let off = if version == 1 { 20 } else { 12 };
                t.id = body
                    .get(off..off + 4)
                    .map(BigEndian::read_u32)
                    .unwrap_or(0);
            }
            b"mdia" => parse_mdia(body, &mut t)?,
            _ => {}
        }
    }
    Ok(t)
}

fn parse_mdia(mdia: &[u8], t: &mut Track) -> Result<(), Error> {
    for (typ, body) in Boxes::new(mdia) {
        match &typ {
            b"mdhd" => {
                let version = body.first().copied().unwrap_or(0);
                let off = if version == 1 { 20 } else { 12 };
                t.timescale = body
                    .get(off..off + 4)
                    .map(BigEndian::read_u32)
                    .unwrap_or(0);
            }
            b"hdlr" => {
                if let Some(h) = body.get(8..12) {
                    t.handler = h.try_into().unwrap();
                }
            }
            b"minf" => {
                for (mtyp, mbody) in Boxes::new(body) {
                    if &mtyp == b"stbl" {
                        parse_stbl(mbody, t)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl(stbl: &[u8], t: &mut Track) -> Result<(), Error> {
    let full = |body: &[u8]| -> Result<(u32, usize), Error> {
        let count = body
            .get(4..8)
            .map(BigEndian::read_u32)
            .ok_or_else(|| err!(DataLoss, msg("truncated sample table box")))?;
        Ok((count, 8))
    };
    for (typ, body) in Boxes::new(stbl) {
        match &typ {
            b"stsd" => parse_stsd(body, t)?,
            b"stts" => {
                let (count, mut pos) = full(body)?;
                for _ in 0..count {
                    let e = body
                        .get(pos..pos + 8)
                        .ok_or_else(|| err!(DataLoss, msg("truncated stts")))?;
                    t.stts
                        .push((BigEndian::read_u32(&e[..4]), BigEndian::read_u32(&e[4..])));
                    pos += 8;
                }
            }
            b"ctts" => {
                let (count, mut pos) = full(body)?;
                for _ in 0..count {
                    let e = body
                        .get(pos..pos + 8)
                        .ok_or_else(|| err!(DataLoss, msg("truncated ctts")))?;
                    // Version 1 offsets are signed; version 0 values fit
                    // either way in practice.
                    t.ctts
                        .push((BigEndian::read_u32(&e[..4]), BigEndian::read_i32(&e[4..])));
                    pos += 8;
                }
            }
            b"stsc" => {
                let (count, mut pos) = full(body)?;
                for _ in 0..count {
                    let e = body
                        .get(pos..pos + 12)
                        .ok_or_else(|| err!(DataLoss, msg("truncated stsc")))?;
                    t.stsc.push(StscEntry {
                        first_chunk: BigEndian::read_u32(&e[..4]),
                        samples_per_chunk: BigEndian::read_u32(&e[4..8]),
                        sample_description_index: BigEndian::read_u32(&e[8..12]),
                    });
                    pos += 12;
                }
            }
            b"stsz" => {
                let default = body
                    .get(4..8)
                    .map(BigEndian::read_u32)
                    .ok_or_else(|| err!(DataLoss, msg("truncated stsz")))?;
                let count = body
                    .get(8..12)
                    .map(BigEndian::read_u32)
                    .ok_or_else(|| err!(DataLoss, msg("truncated stsz")))?;
                t.sizes = SampleSizes { default, count };
                if default == 0 {
                    let mut pos = 12;
                    for _ in 0..count {
                        let e = body
                            .get(pos..pos + 4)
                            .ok_or_else(|| err!(DataLoss, msg("truncated stsz")))?;
                        t.explicit_sizes.push(BigEndian::read_u32(e));
                        pos += 4;
                    }
                }
            }
            b"stco" => {
                let (count, mut pos) = full(body)?;
                for _ in 0..count {
                    let e = body
                        .get(pos..pos + 4)
                        .ok_or_else(|| err!(DataLoss, msg("truncated stco")))?;
                    t.chunk_offsets.push(u64::from(BigEndian::read_u32(e)));
                    pos += 4;
                }
            }
            b"co64" => {
                let (count, mut pos) = full(body)?;
                for _ in 0..count {
                    let e = body
                        .get(pos..pos + 8)
                        .ok_or_else(|| err!(DataLoss, msg("truncated co64")))?;
                    t.chunk_offsets.push(BigEndian::read_u64(e));
                    pos += 8;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stsd(stsd: &[u8], t: &mut Track) -> Result<(), Error> {
    // Full box header + entry count, then the first sample entry.
    let entry = stsd
        .get(8..)
        .ok_or_else(|| err!(DataLoss, msg("truncated stsd")))?;
    let Some((typ, body)) = Boxes::new(entry).next() else {
        return Ok(());
    };
    t.subtype = typ;
    match &typ {
        b"avc1" | b"hev1" | b"hvc1" => {
            // Skip the VisualSampleEntry fields to the config sub-boxes.
            let Some(config_area) = body.get(78..) else {
                return Ok(());
            };
            for (ctyp, cbody) in Boxes::new(config_area) {
                match &ctyp {
                    b"avcC" => parse_avcc(cbody, t),
                    b"hvcC" => parse_hvcc(cbody, t),
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// AVCDecoderConfigurationRecord, ISO/IEC 14496-15 section 5.2.4.1.
fn parse_avcc(b: &[u8], t: &mut Track) {
    if b.len() < 6 || b[0] != 1 {
        warn!("bad AVCDecoderConfigurationRecord, ignoring");
        return;
    }
    t.nal_unit_size = (b[4] & 0x03) + 1;
    let mut pos = 5;
    let num_sps = (b[pos] & 0x1F) as usize;
    pos += 1;
    for _ in 0..num_sps {
        let Some(len) = b.get(pos..pos + 2).map(|l| BigEndian::read_u16(l) as usize) else {
            return;
        };
        pos += 2;
        let Some(sps) = b.get(pos..pos + len) else {
            return;
        };
        t.param_sets.push(sps.to_vec());
        pos += len;
    }
    let Some(&num_pps) = b.get(pos) else { return };
    pos += 1;
    for _ in 0..num_pps {
        let Some(len) = b.get(pos..pos + 2).map(|l| BigEndian::read_u16(l) as usize) else {
            return;
        };
        pos += 2;
        let Some(pps) = b.get(pos..pos + len) else {
            return;
        };
        t.param_sets.push(pps.to_vec());
        pos += len;
    }
}

/// HEVCDecoderConfigurationRecord, ISO/IEC 14496-15 section 8.3.3.1.
fn parse_hvcc(b: &[u8], t: &mut Track) {
    if b.len() < 23 || b[0] != 1 {
        warn!("bad HEVCDecoderConfigurationRecord, ignoring");
        return;
    }
    t.nal_unit_size = (b[21] & 0x03) + 1;
    let num_arrays = b[22] as usize;
    let mut pos = 23;
    for _ in 0..num_arrays {
        let Some(hdr) = b.get(pos..pos + 3) else { return };
        let num_nalus = BigEndian::read_u16(&hdr[1..3]) as usize;
        pos += 3;
        for _ in 0..num_nalus {
            let Some(len) = b.get(pos..pos + 2).map(|l| BigEndian::read_u16(l) as usize)
            else {
                return;
            };
            pos += 2;
            let Some(nalu) = b.get(pos..pos + len) else {
                return;
            };
            t.param_sets.push(nalu.to_vec());
            pos += len;
        }
    }
}

/// Nero `chpl`: chapter marks with 100 ns timestamps.
fn parse_chpl(body: &[u8]) -> Vec<Chapter> {
    let version = body.first().copied().unwrap_or(0);
    let mut pos = if version == 1 { 9 } else { 5 };
    let count = body
        .get(pos - 1)
        .copied()
        .unwrap_or(0);
    let mut chapters = Vec::new();
    for _ in 0..count {
        let Some(ts) = body.get(pos..pos + 8).map(BigEndian::read_i64) else {
            break;
        };
        let Some(&len) = body.get(pos + 8) else { break };
        let Some(name) = body.get(pos + 9..pos + 9 + len as usize) else {
            break;
        };
        chapters.push(Chapter {
            time: MsTime(ts / 10_000),
            name: String::from_utf8_lossy(name).into_owned(),
        });
        pos += 9 + len as usize;
    }
    chapters
}

/// Writes chapters in the `CHAPTERxx=` text form.
pub fn dump_chapters<W: std::io::Write>(chapters: &[Chapter], out: &mut W) -> Result<(), Error> {
    for (i, c) in chapters.iter().enumerate() {
        let ms = c.time.0;
        writeln!(
            out,
            "CHAPTER{:02}={:02}:{:02}:{:02}.{:03}",
            i + 1,
            ms / 3_600_000,
            ms / 60_000 % 60,
            ms / 1_000 % 60,
            ms % 1_000
        )?;
        writeln!(out, "CHAPTER{:02}NAME={}", i + 1, c.name)?;
    }
    Ok(())
}

/// Track counts found, for the end-of-file report.
#[derive(Debug, Default, Serialize)]
pub struct TrackSummary {
    pub avc_tracks: u32,
    pub hevc_tracks: u32,
    pub xdvb_tracks: u32,
    pub cc_tracks: u32,
    pub vobsub_tracks: u32,
}

/// Locates the `cc_data` run inside a `ccdp` atom's CDP, returning the
/// triples and their count.
fn cdp_find_data(data: &[u8]) -> Option<(&[u8], usize)> {
    let mut r = crate::bitstream::BitReader::new(data);
    if r.next_bits(16) as u16 != CDP_MAGIC {
        debug!(target: "ccdemux::parse", "ccdp: unexpected CDP header");
        return None;
    }
    r.skip_bits(16);
    let cdp_data_count = r.read_bits(8) as usize;
    if cdp_data_count != data.len() {
        debug!(
            target: "ccdemux::parse",
            "ccdp: unexpected data length {cdp_data_count} != {}",
            data.len()
        );
        return None;
    }
    let _cdp_frame_rate = r.read_bits(4);
    r.skip_bits(4); // reserved
    let timecode_added = r.read_bits(1) == 1;
    let data_added = r.read_bits(1) == 1;
    r.skip_bits(6); // remaining flags
    r.skip_bits(16); // sequence counter
    if !data_added {
        debug!(target: "ccdemux::parse", "ccdp: packet without data");
        return None;
    }
    if timecode_added {
        r.skip_bits(32);
    }
    if r.read_bits(8) as u8 != CDP_SECTION_DATA {
        debug!(target: "ccdemux::parse", "ccdp: cc_data_section byte not found");
        return None;
    }
    r.skip_bits(3); // marker bits
    let cc_count = r.read_bits(5) as usize;
    if !matches!(cc_count, 10 | 20 | 25 | 30) {
        debug!(target: "ccdemux::parse", "ccdp: unexpected cc_count {cc_count}");
        return None;
    }
    if r.had_error() {
        return None;
    }
    let Some(triples) = r.read_bytes(cc_count * 3) else {
        debug!(target: "ccdemux::parse", "ccdp: not enough bytes for {cc_count} triples");
        return None;
    };
    Some((triples, cc_count))
}

/// Runs the whole file: classifies each track and feeds its samples through
/// the matching caption path.
pub fn process_file<R: Read + Seek>(
    r: &mut R,
    mp4: &Mp4File,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    shutdown: &shutdown::Receiver,
) -> Result<TrackSummary, Error> {
    let mut summary = TrackSummary::default();
    for t in &mp4.tracks {
        match (&t.handler, &t.subtype) {
            (b"vide", b"avc1") => summary.avc_tracks += 1,
            (b"vide", b"hev1" | b"hvc1") => summary.hevc_tracks += 1,
            (b"vide", b"xdvb") => summary.xdvb_tracks += 1,
            (b"clcp" | b"subt" | b"sbtl" | b"text", _) => summary.cc_tracks += 1,
            (b"subp", b"MPEG") => summary.vobsub_tracks += 1,
            _ => {}
        }
    }
    info!(
        "MP4: found {} tracks: {} avc, {} hevc, {} xdvb, {} cc, {} vobsub",
        mp4.tracks.len(),
        summary.avc_tracks,
        summary.hevc_tracks,
        summary.xdvb_tracks,
        summary.cc_tracks,
        summary.vobsub_tracks
    );

    let mut buf = Vec::new();
    for t in &mp4.tracks {
        shutdown.check()?;
        match (&t.handler, &t.subtype) {
            (b"vide", b"xdvb") => {
                if summary.cc_tracks > 0 && !pl.opts.mp4_video_track {
                    continue;
                }
                process_video_track(r, t, pl, sink, shutdown, &mut buf, VideoKind::Mpeg2)?;
            }
            (b"vide", b"avc1") => {
                if summary.cc_tracks > 0 && !pl.opts.mp4_video_track {
                    continue;
                }
                process_video_track(r, t, pl, sink, shutdown, &mut buf, VideoKind::Avc)?;
            }
            (b"vide", b"hev1" | b"hvc1") => {
                if summary.cc_tracks > 0 && !pl.opts.mp4_video_track {
                    continue;
                }
                process_video_track(r, t, pl, sink, shutdown, &mut buf, VideoKind::Hevc)?;
            }
            (b"clcp", b"c608") => {
                if summary.avc_tracks > 0 && pl.opts.mp4_video_track {
                    continue;
                }
                process_c608_track(r, t, pl, sink, shutdown, &mut buf)?;
            }
            (b"clcp", b"c708") => {
                if summary.avc_tracks > 0 && pl.opts.mp4_video_track {
                    continue;
                }
                process_c708_track(r, t, pl, sink, shutdown, &mut buf)?;
            }
            (b"text" | b"sbtl" | b"subt", b"tx3g") => {
                if summary.avc_tracks > 0 && pl.opts.mp4_video_track {
                    continue;
                }
                process_tx3g_track(r, t, pl, sink, shutdown, &mut buf)?;
            }
            (b"text", b"text") => {
                info!("text:text subtitle tracks are not supported yet");
            }
            (b"subp", b"MPEG") => {
                // SPU decoding plus OCR happens in an external collaborator.
                info!(
                    "track {} is a VOBSUB subpicture track; OCR conversion is not built in, \
                     skipping",
                    t.id
                );
            }
            _ => {
                debug!(
                    target: "ccdemux::parse",
                    "ignoring track {} ({}:{})",
                    t.id,
                    String::from_utf8_lossy(&t.handler),
                    String::from_utf8_lossy(&t.subtype),
                );
            }
        }
    }
    Ok(summary)
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum VideoKind {
    Mpeg2,
    Avc,
    Hevc,
}

fn read_sample<R: Read + Seek>(
    r: &mut R,
    s: &Sample,
    buf: &mut Vec<u8>,
) -> Result<bool, Error> {
    buf.resize(s.size as usize, 0);
    r.seek(SeekFrom::Start(s.offset))?;
    read_exact_or_eof(r, buf)
}

fn process_video_track<R: Read + Seek>(
    r: &mut R,
    t: &Track,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    shutdown: &shutdown::Receiver,
    buf: &mut Vec<u8>,
    kind: VideoKind,
) -> Result<(), Error> {
    // Container timestamps anchor each sample, so the decoder's block
    // counters must not advance on their own.
    let data_type = match kind {
        VideoKind::Mpeg2 => BufferDataType::Pes,
        VideoKind::Avc | VideoKind::Hevc => BufferDataType::H264,
    };
    pl.is_hevc = kind == VideoKind::Hevc;

    // Feed the parameter sets from the decoder configuration first; SEI and
    // slices are useless without them.
    for ps in &t.param_sets {
        let mut ps = ps.clone();
        pl.do_nal(sink, data_type, &mut ps)?;
    }

    for s in t.samples() {
        shutdown.check()?;
        if !read_sample(r, &s, buf)? {
            warn!("track {}: sample at {:#x} is truncated, stopping", t.id, s.offset);
            break;
        }
        pl.timing.set_current_pts(base::time::Mts(t.sample_pts(&s)));
        pl.timing.set_fts();
        match kind {
            VideoKind::Mpeg2 => {
                pl.m2v.process(&mut pl.timing, &mut pl.seqr, sink, buf)?;
            }
            VideoKind::Avc | VideoKind::Hevc => {
                walk_length_prefixed_nals(t, pl, sink, data_type, buf)?;
                if kind == VideoKind::Hevc {
                    // No HEVC slice-order recovery: flush at sample end.
                    pl.hevc.flush_sample(
                        &mut pl.avc,
                        &mut pl.timing,
                        &mut pl.seqr,
                        sink,
                        data_type,
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Walks `nal_unit_size`-prefixed NAL units inside one sample body.
fn walk_length_prefixed_nals(
    t: &Track,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    data_type: BufferDataType,
    buf: &mut [u8],
) -> Result<(), Error> {
    let prefix = t.nal_unit_size as usize;
    let mut i = 0usize;
    while i < buf.len() {
        if i + prefix > buf.len() {
            info!(
                "corrupted sample: {} bytes left, {} needed for a NAL length; ignoring",
                buf.len() - i,
                prefix
            );
            return Ok(());
        }
        let nal_length = match prefix {
            1 => buf[i] as usize,
            2 => BigEndian::read_u16(&buf[i..]) as usize,
            4 => BigEndian::read_u32(&buf[i..]) as usize,
            _ => bail!(DataLoss, msg("unexpected NAL length prefix size {prefix}")),
        };
        i += prefix;
        if nal_length > buf.len() - i {
            info!(
                "corrupted sample: NAL length {nal_length} overruns the sample; ignoring"
            );
            return Ok(());
        }
        if nal_length > 0 {
            pl.do_nal(sink, data_type, &mut buf[i..i + nal_length])?;
        }
        i += nal_length;
    }
    Ok(())
}

/// `cdat`/`cdt2` atoms: raw 608 byte pairs, fed two at a time.
fn process_c608_track<R: Read + Seek>(
    r: &mut R,
    t: &Track,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    shutdown: &shutdown::Receiver,
    buf: &mut Vec<u8>,
) -> Result<(), Error> {
    for s in t.samples() {
        shutdown.check()?;
        if !read_sample(r, &s, buf)? {
            warn!("track {}: sample at {:#x} is truncated, stopping", t.id, s.offset);
            break;
        }
        pl.timing.set_current_pts(base::time::Mts(t.sample_pts(&s)));
        pl.timing.set_fts();
        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let atom_length = BigEndian::read_u32(&buf[pos..]) as usize;
            if atom_length < 8 || pos + atom_length > buf.len() {
                info!(
                    "invalid caption atom length {atom_length} (sample is {} bytes)",
                    buf.len()
                );
                break;
            }
            let tag = &buf[pos + 4..pos + 8];
            if tag == b"cdat" || tag == b"cdt2" {
                // Feed pairs one at a time so timing can be adjusted between
                // them downstream.
                let payload = &buf[pos + 8..pos + atom_length];
                for pair in payload.chunks_exact(2) {
                    sink.cc_data(pl.timing.fts_now(), BufferDataType::Raw, pair)?;
                }
            } else if tag == b"ccdp" {
                info!("found a c708 ccdp atom inside a c608 track; please report this sample");
                break;
            }
            pos += atom_length;
        }
    }
    Ok(())
}

/// `ccdp` atoms: a CDP wrapping CEA-708 cc_data triples.
fn process_c708_track<R: Read + Seek>(
    r: &mut R,
    t: &Track,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    shutdown: &shutdown::Receiver,
    buf: &mut Vec<u8>,
) -> Result<(), Error> {
    for s in t.samples() {
        shutdown.check()?;
        if !read_sample(r, &s, buf)? {
            warn!("track {}: sample at {:#x} is truncated, stopping", t.id, s.offset);
            break;
        }
        pl.timing.set_current_pts(base::time::Mts(t.sample_pts(&s)));
        pl.timing.set_fts();
        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let atom_length = BigEndian::read_u32(&buf[pos..]) as usize;
            if atom_length < 8 || pos + atom_length > buf.len() {
                info!(
                    "invalid caption atom length {atom_length} (sample is {} bytes)",
                    buf.len()
                );
                break;
            }
            let tag = &buf[pos + 4..pos + 8];
            if tag == b"ccdp" {
                let content = &buf[pos + 8..pos + atom_length];
                if let Some((triples, _)) = cdp_find_data(content) {
                    let fts = pl.timing.fts_now();
                    emit_cdp_triples(triples, fts, sink)?;
                } else {
                    debug!(target: "ccdemux::parse", "no cc data found in ccdp atom");
                }
            } else if tag == b"cdat" || tag == b"cdt2" {
                info!("found a c608 atom inside a c708 track; please report this sample");
                break;
            }
            pos += atom_length;
        }
    }
    Ok(())
}

fn emit_cdp_triples(triples: &[u8], fts: MsTime, sink: &mut dyn CaptionSink) -> Result<(), Error> {
    for triple in triples.chunks_exact(3) {
        let t = CcTriple {
            cc_info: triple[0],
            data: [triple[1], triple[2]],
        };
        if t.cc_info == CDP_SECTION_SVC_INFO || t.cc_info == CDP_SECTION_FOOTER {
            debug!(target: "ccdemux::parse", "ccdp: premature end of cc_data section");
            break;
        }
        if matches!(t.cc_info, 0xFA | 0xFC | 0xFD)
            && t.data[0] & 0x7F == 0
            && t.data[1] & 0x7F == 0
        {
            // Zero-pair padding.
            continue;
        }
        if t.cc_type() < 2 {
            // Only DTVCC packet data belongs in a c708 track.
            continue;
        }
        sink.cc_data(fts, BufferDataType::H264, triple)?;
    }
    Ok(())
}

/// 3GPP timed text: a 16-bit length plus UTF-8/UTF-16 text per sample. A
/// subtitle's end time is its successor's start time.
fn process_tx3g_track<R: Read + Seek>(
    r: &mut R,
    t: &Track,
    pl: &mut Pipeline,
    sink: &mut dyn CaptionSink,
    shutdown: &shutdown::Receiver,
    buf: &mut Vec<u8>,
) -> Result<(), Error> {
    let mut pending: Option<(MsTime, String)> = None;
    for s in t.samples() {
        shutdown.check()?;
        if !read_sample(r, &s, buf)? {
            warn!("track {}: sample at {:#x} is truncated, stopping", t.id, s.offset);
            break;
        }
        pl.timing.set_current_pts(base::time::Mts(t.sample_pts(&s)));
        pl.timing.set_fts();
        let now = pl.timing.fts_now();

        // The previous subtitle's end time is now known.
        if let Some((start, text)) = pending.take() {
            sink.text_subtitle(start, Some(now), &text)?;
        }

        if buf.len() < 2 {
            continue;
        }
        let text_len = BigEndian::read_u16(&buf[..2]) as usize;
        if text_len == 0 {
            continue;
        }
        if text_len > buf.len() - 2 {
            info!("invalid tx3g atom length {text_len} (sample is {} bytes)", buf.len());
            continue;
        }
        let text = decode_tx3g_text(&buf[2..2 + text_len]);
        pending = Some((now, text));
    }
    if let Some((start, text)) = pending {
        sink.text_subtitle(start, None, &text)?;
    }
    Ok(())
}

fn decode_tx3g_text(raw: &[u8]) -> String {
    if raw.len() >= 2 && (raw[..2] == [0xFE, 0xFF] || raw[..2] == [0xFF, 0xFE]) {
        let be = raw[0] == 0xFE;
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|c| {
                if be {
                    u16::from_be_bytes([c[0], c[1]])
                } else {
                    u16::from_le_bytes([c[0], c[1]])
                }
            })
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::testutil::RecordingSink;
    use crate::options::Options;
    use crate::sequencer::StorePolicy;
    use crate::testutil;
    use std::io::Cursor;

    fn boxx(typ: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut b = Vec::with_capacity(8 + body.len());
        b.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
        b.extend_from_slice(typ);
        b.extend_from_slice(body);
        b
    }

    fn full_box(typ: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut b = vec![version, 0, 0, 0];
        b.extend_from_slice(body);
        boxx(typ, &b)
    }

    fn u32s(vals: &[u32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    struct TrakSpec {
        id: u32,
        handler: [u8; 4],
        sample_entry: Vec<u8>,
        timescale: u32,
        stts: Vec<(u32, u32)>,
        stsc: Vec<(u32, u32, u32)>,
        sizes: Vec<u32>,
        chunk_offsets: Vec<u32>,
    }

    fn build_trak(spec: &TrakSpec) -> Vec<u8> {
        let mut tkhd_body = vec![0u8; 12];
        tkhd_body.extend_from_slice(&spec.id.to_be_bytes());
        let tkhd = full_box(b"tkhd", 0, &tkhd_body[4..]);

        let mut mdhd_body = vec![0u8; 8];
        mdhd_body.extend_from_slice(&spec.timescale.to_be_bytes());
        mdhd_body.extend_from_slice(&0u32.to_be_bytes()); // duration
        let mdhd = full_box(b"mdhd", 0, &mdhd_body);

        let mut hdlr_body = vec![0u8; 4];
        hdlr_body.extend_from_slice(&spec.handler);
        hdlr_body.extend_from_slice(&[0u8; 12]);
        let hdlr = full_box(b"hdlr", 0, &hdlr_body);

        let mut stsd_body = 1u32.to_be_bytes().to_vec();
        stsd_body.extend_from_slice(&spec.sample_entry);
        let stsd = full_box(b"stsd", 0, &stsd_body);

        let mut stts_body = (spec.stts.len() as u32).to_be_bytes().to_vec();
        for &(c, d) in &spec.stts {
            stts_body.extend_from_slice(&u32s(&[c, d]));
        }
        let stts = full_box(b"stts", 0, &stts_body);

        let mut stsc_body = (spec.stsc.len() as u32).to_be_bytes().to_vec();
        for &(f, s, d) in &spec.stsc {
            stsc_body.extend_from_slice(&u32s(&[f, s, d]));
        }
        let stsc = full_box(b"stsc", 0, &stsc_body);

        let mut stsz_body = u32s(&[0, spec.sizes.len() as u32]);
        stsz_body.extend_from_slice(&u32s(&spec.sizes));
        let stsz = full_box(b"stsz", 0, &stsz_body);

        let mut stco_body = (spec.chunk_offsets.len() as u32).to_be_bytes().to_vec();
        stco_body.extend_from_slice(&u32s(&spec.chunk_offsets));
        let stco = full_box(b"stco", 0, &stco_body);

        let stbl = boxx(
            b"stbl",
            &[stsd, stts, stsc, stsz, stco].concat(),
        );
        let minf = boxx(b"minf", &stbl);
        let mdia = boxx(b"mdia", &[mdhd, hdlr, minf].concat());
        boxx(b"trak", &[tkhd, mdia].concat())
    }

    fn build_file(traks: &[Vec<u8>], mdat: &[u8]) -> Vec<u8> {
        // ftyp, then mdat at a known offset, then moov.
        let ftyp = boxx(b"ftyp", b"isom\x00\x00\x02\x00isomiso2");
        let mdat_box = boxx(b"mdat", mdat);
        let moov = boxx(b"moov", &traks.concat());
        [ftyp, mdat_box, moov].concat()
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(&Options::default(), StorePolicy::Append)
    }

    #[test]
    fn sample_iter_layout() {
        let mut t = Track::new();
        t.sizes = SampleSizes { default: 0, count: 3 };
        t.explicit_sizes = vec![10, 20, 30];
        t.stts = vec![(3, 100)];
        t.stsc = vec![StscEntry {
            first_chunk: 1,
            samples_per_chunk: 2,
            sample_description_index: 1,
        }];
        t.chunk_offsets = vec![1000, 2000];
        let samples: Vec<Sample> = t.samples().collect();
        assert_eq!(samples.len(), 3);
        assert_eq!((samples[0].dts, samples[0].offset), (0, 1000));
        assert_eq!((samples[1].dts, samples[1].offset), (100, 1010));
        assert_eq!((samples[2].dts, samples[2].offset), (200, 2000));
    }

    #[test]
    fn sample_pts_rescales() {
        let mut t = Track::new();
        t.timescale = 30_000;
        let s = Sample {
            dts: 3003,
            cts_offset: 0,
            size: 0,
            offset: 0,
            sample_description_index: 1,
        };
        assert_eq!(t.sample_pts(&s), 3003 * 3); // 100.1 ms at 90 kHz
    }

    #[test]
    fn parse_and_process_c608() {
        testutil::init();
        // One cdat atom with two byte pairs.
        let mut cdat = boxx(b"cdat", &[0x94, 0x20, 0x94, 0x2C]);
        let sample_len = cdat.len() as u32;
        let mut mdat = vec![0u8; 16]; // padding inside mdat before the sample
        mdat.append(&mut cdat);
        // mdat body starts at ftyp(24) + mdat header(8) = offset 32.
        let sample_offset = 24 + 8 + 16;
        let trak = build_trak(&TrakSpec {
            id: 1,
            handler: *b"clcp",
            sample_entry: boxx(b"c608", &[0u8; 16]),
            timescale: 30_000,
            stts: vec![(1, 3003)],
            stsc: vec![(1, 1, 1)],
            sizes: vec![sample_len],
            chunk_offsets: vec![sample_offset],
        });
        let file = build_file(&[trak], &mdat);

        let mut cursor = Cursor::new(file);
        let mp4 = Mp4File::parse(&mut cursor).unwrap();
        assert_eq!(mp4.tracks.len(), 1);
        assert_eq!(&mp4.tracks[0].handler, b"clcp");
        assert_eq!(&mp4.tracks[0].subtype, b"c608");

        let mut pl = pipeline();
        let mut sink = RecordingSink::default();
        let summary = process_file(
            &mut cursor,
            &mp4,
            &mut pl,
            &mut sink,
            &shutdown::Receiver::detached(),
        )
        .unwrap();
        assert_eq!(summary.cc_tracks, 1);
        assert_eq!(sink.emissions.len(), 2);
        assert_eq!(sink.emissions[0].1, BufferDataType::Raw);
        assert_eq!(sink.emissions[0].2, vec![0x94, 0x20]);
        assert_eq!(sink.emissions[1].2, vec![0x94, 0x2C]);
    }

    #[test]
    fn parse_avcc_and_dispatch_sample() {
        testutil::init();
        #[rustfmt::skip]
        let avcc = boxx(b"avcC", &[
            1, 0x42, 0x00, 0x0A, // version, profile, compat, level
            0xFF, // lengthSizeMinusOne = 3
            0xE1, // one SPS
            0x00, 0x05, 0x67, 0x42, 0x00, 0x0A, 0xFB,
            0x01, // one PPS
            0x00, 0x04, 0x68, 0xEE, 0x3C, 0x80,
        ]);
        let mut entry_body = vec![0u8; 78];
        entry_body.extend_from_slice(&avcc);
        let entry = boxx(b"avc1", &entry_body);

        // Sample: an SEI NAL with caption data, 4-byte length prefix.
        #[rustfmt::skip]
        let sei_payload = [
            0xB5, 0x00, 0x31,
            b'G', b'A', b'9', b'4',
            0x03, 0x41, 0xFF,
            0xFC, 0x94, 0x20,
            0xFF,
        ];
        let mut sei_nal = vec![0x06, 0x04, sei_payload.len() as u8];
        sei_nal.extend_from_slice(&sei_payload);
        sei_nal.push(0x80);
        let mut sample = (sei_nal.len() as u32).to_be_bytes().to_vec();
        sample.extend_from_slice(&sei_nal);

        let sample_offset = 24 + 8;
        let trak = build_trak(&TrakSpec {
            id: 1,
            handler: *b"vide",
            sample_entry: entry,
            timescale: 90_000,
            stts: vec![(1, 3000)],
            stsc: vec![(1, 1, 1)],
            sizes: vec![sample.len() as u32],
            chunk_offsets: vec![sample_offset],
        });
        let file = build_file(&[trak], &sample);

        let mut cursor = Cursor::new(file);
        let mp4 = Mp4File::parse(&mut cursor).unwrap();
        let t = &mp4.tracks[0];
        assert_eq!(t.nal_unit_size, 4);
        assert_eq!(t.param_sets.len(), 2);
        assert_eq!(t.param_sets[0][0] & 0x1F, 7);
        assert_eq!(t.param_sets[1][0] & 0x1F, 8);

        let mut pl = pipeline();
        let mut sink = RecordingSink::default();
        process_file(
            &mut cursor,
            &mp4,
            &mut pl,
            &mut sink,
            &shutdown::Receiver::detached(),
        )
        .unwrap();
        assert!(pl.avc.got_seq_para);
        assert_eq!(pl.avc.stats.num_nal_unit_type_7, 1);
        // The SEI caption bytes are buffered, waiting for slice headers.
        assert_eq!(pl.avc.cc_count, 1);
    }

    fn build_cdp(triples: &[u8]) -> Vec<u8> {
        let cc_count = triples.len() / 3;
        let total = 2 + 2 + 3 + 2 + triples.len() + 4;
        let mut cdp = Vec::new();
        cdp.extend_from_slice(&CDP_MAGIC.to_be_bytes());
        cdp.push(total as u8);
        cdp.push(0x4F); // frame rate 4 (29.97), reserved low bits
        cdp.push(0x40); // cc_data present, no timecode
        cdp.extend_from_slice(&[0x00, 0x01]); // sequence counter
        cdp.push(CDP_SECTION_DATA);
        cdp.push(0xE0 | cc_count as u8);
        cdp.extend_from_slice(triples);
        // Footer section.
        cdp.push(CDP_SECTION_FOOTER);
        cdp.extend_from_slice(&[0x00, 0x01]);
        cdp.push(0x00); // checksum (unchecked)
        cdp
    }

    #[test]
    fn cdp_extraction() {
        testutil::init();
        let mut triples = vec![0xFE, 0x12, 0x34];
        // Pad to a legal cc_count of 10 with empty NTSC pairs.
        while triples.len() < 30 {
            triples.extend_from_slice(&[0xFA, 0x00, 0x00]);
        }
        let cdp = build_cdp(&triples);
        let (data, count) = cdp_find_data(&cdp).unwrap();
        assert_eq!(count, 10);
        assert_eq!(&data[..3], &[0xFE, 0x12, 0x34]);

        // Bad magic.
        let mut bad = cdp.clone();
        bad[0] = 0;
        assert!(cdp_find_data(&bad).is_none());
        // Wrong length byte.
        let mut bad = cdp.clone();
        bad[2] ^= 0xFF;
        assert!(cdp_find_data(&bad).is_none());
    }

    #[test]
    fn c708_track_emits_dtvcc_triples() {
        testutil::init();
        let mut triples = vec![
            0xFE, 0x12, 0x34, // DTVCC packet data
            0xFC, 0x94, 0x20, // NTSC field pair: dropped (cc_type < 2)
        ];
        while triples.len() < 30 {
            triples.extend_from_slice(&[0xFA, 0x00, 0x00]);
        }
        let cdp = build_cdp(&triples);
        let ccdp = boxx(b"ccdp", &cdp);

        let sample_offset = 24 + 8;
        let trak = build_trak(&TrakSpec {
            id: 1,
            handler: *b"clcp",
            sample_entry: boxx(b"c708", &[0u8; 16]),
            timescale: 30_000,
            stts: vec![(1, 1001)],
            stsc: vec![(1, 1, 1)],
            sizes: vec![ccdp.len() as u32],
            chunk_offsets: vec![sample_offset],
        });
        let file = build_file(&[trak], &ccdp);
        let mut cursor = Cursor::new(file);
        let mp4 = Mp4File::parse(&mut cursor).unwrap();

        let mut pl = pipeline();
        let mut sink = RecordingSink::default();
        process_file(
            &mut cursor,
            &mp4,
            &mut pl,
            &mut sink,
            &shutdown::Receiver::detached(),
        )
        .unwrap();
        assert_eq!(sink.emissions.len(), 1);
        assert_eq!(sink.emissions[0].1, BufferDataType::H264);
        assert_eq!(sink.emissions[0].2, vec![0xFE, 0x12, 0x34]);
    }

    #[test]
    fn tx3g_end_time_from_next_sample() {
        testutil::init();
        let mk_sample = |text: &str| {
            let mut s = (text.len() as u16).to_be_bytes().to_vec();
            s.extend_from_slice(text.as_bytes());
            s
        };
        let s1 = mk_sample("hello");
        let s2 = mk_sample("world");
        let mdat = [s1.clone(), s2.clone()].concat();
        let base_off = 24 + 8;
        let trak = build_trak(&TrakSpec {
            id: 1,
            handler: *b"text",
            sample_entry: boxx(b"tx3g", &[0u8; 16]),
            timescale: 1_000,
            stts: vec![(2, 2_000)],
            stsc: vec![(1, 2, 1)],
            sizes: vec![s1.len() as u32, s2.len() as u32],
            chunk_offsets: vec![base_off],
        });
        let file = build_file(&[trak], &mdat);
        let mut cursor = Cursor::new(file);
        let mp4 = Mp4File::parse(&mut cursor).unwrap();

        let mut pl = pipeline();
        let mut sink = RecordingSink::default();
        process_file(
            &mut cursor,
            &mp4,
            &mut pl,
            &mut sink,
            &shutdown::Receiver::detached(),
        )
        .unwrap();
        assert_eq!(sink.texts.len(), 2);
        assert_eq!(sink.texts[0], (MsTime(0), Some(MsTime(2_000)), "hello".to_owned()));
        assert_eq!(sink.texts[1], (MsTime(2_000), None, "world".to_owned()));
    }

    #[test]
    fn chapters_parse_and_dump() {
        testutil::init();
        // chpl version 1: 4 reserved bytes, count, then entries.
        let mut body = vec![1, 0, 0, 0, 0, 0, 0, 0, 2];
        body.extend_from_slice(&0i64.to_be_bytes());
        body.push(5);
        body.extend_from_slice(b"Intro");
        body.extend_from_slice(&(95_000_000_000i64 / 100).to_be_bytes());
        body.push(3);
        body.extend_from_slice(b"End");
        let chapters = parse_chpl(&body);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].name, "Intro");
        assert_eq!(chapters[1].time, MsTime(95_000));

        let mut out = Vec::new();
        dump_chapters(&chapters, &mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(
            s,
            "CHAPTER01=00:00:00.000\nCHAPTER01NAME=Intro\n\
             CHAPTER02=00:01:35.000\nCHAPTER02NAME=End\n"
        );
    }

    #[test]
    fn utf16_text_decoding() {
        let mut raw = vec![0xFE, 0xFF];
        for c in "héllo".encode_utf16() {
            raw.extend_from_slice(&c.to_be_bytes());
        }
        assert_eq!(decode_tx3g_text(&raw), "héllo");
        assert_eq!(decode_tx3g_text(b"plain"), "plain");
    }
}

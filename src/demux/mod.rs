// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Container handling: input abstraction, stream-mode detection, and the
//! pipeline state shared by every container driver.

pub mod asf;
pub mod mp4;

use crate::avc::AvcContext;
use crate::caption::{BufferDataType, CaptionSink};
use crate::hevc::HevcContext;
use crate::m2v::M2vContext;
use crate::options::Options;
use crate::sequencer::{Sequencer, StorePolicy};
use crate::timing::Timing;
use base::time::Mts;
use base::Error;
use std::fmt;
use std::io::{BufReader, Read};
use std::path::Path;

/// The byte producer a demuxer pulls from: a file, pipe, or test buffer.
///
/// `read` is best-effort: it returns less than requested only at end of
/// input. `past` is the absolute offset consumed so far.
pub trait ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    fn skip(&mut self, n: u64) -> Result<u64, Error>;
    fn past(&self) -> u64;
    fn is_eof(&self) -> bool;
}

/// A file-backed source.
pub struct FileSource {
    inner: BufReader<std::fs::File>,
    past: u64,
    eof: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let f = std::fs::File::open(path)?;
        Ok(FileSource {
            inner: BufReader::new(f),
            past: 0,
            eof: false,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            total += n;
        }
        self.past += total as u64;
        Ok(total)
    }

    fn skip(&mut self, n: u64) -> Result<u64, Error> {
        // Read-and-discard so a skip past the end reports short, like a read.
        let mut scratch = [0u8; 4096];
        let mut remaining = n;
        while remaining > 0 {
            let want = std::cmp::min(scratch.len() as u64, remaining) as usize;
            let got = ByteSource::read(self, &mut scratch[..want])?;
            remaining -= got as u64;
            if got < want {
                break;
            }
        }
        Ok(n - remaining)
    }

    fn past(&self) -> u64 {
        self.past
    }

    fn is_eof(&self) -> bool {
        self.eof
    }
}

/// An in-memory source, used by tests and for stdin capture.
pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        MemSource { data, pos: 0 }
    }
}

impl ByteSource for MemSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = std::cmp::min(buf.len(), self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<u64, Error> {
        let n = std::cmp::min(n as usize, self.data.len() - self.pos);
        self.pos += n;
        Ok(n as u64)
    }

    fn past(&self) -> u64 {
        self.pos as u64
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// The container formats the tool recognizes. Only the elementary-stream,
/// ASF/DVR-MS, and MP4 paths are handled in this crate; the others are
/// reported by name so the caller can route to a sibling tool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamMode {
    ElementaryStream,
    MpegTs,
    MpegPs,
    Asf,
    Wtv,
    Gxf,
    McpoodleRaw,
    Rcwt,
    Matroska,
    Mp4,
    Myth,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamMode::ElementaryStream => "elementary stream",
            StreamMode::MpegTs => "MPEG transport stream",
            StreamMode::MpegPs => "MPEG program stream",
            StreamMode::Asf => "ASF / DVR-MS",
            StreamMode::Wtv => "WTV",
            StreamMode::Gxf => "GXF",
            StreamMode::McpoodleRaw => "McPoodle raw",
            StreamMode::Rcwt => "binary caption dump",
            StreamMode::Matroska => "Matroska / WebM",
            StreamMode::Mp4 => "MP4",
            StreamMode::Myth => "MythTV",
        };
        f.write_str(s)
    }
}

const WTV_MAGIC: [u8; 16] = [
    0xB7, 0xD8, 0x00, 0x20, 0x37, 0x49, 0xDA, 0x11, 0xA6, 0x4E, 0x00, 0x07, 0xE9, 0x5E, 0xAD,
    0x8D,
];

/// Classifies the input from its first bytes (at least 512 are desirable).
pub fn detect_stream_mode(header: &[u8]) -> StreamMode {
    if header.len() >= 16 && header[..16] == asf::ASF_HEADER_GUID {
        return StreamMode::Asf;
    }
    if header.len() >= 16 && header[..16] == WTV_MAGIC {
        return StreamMode::Wtv;
    }
    if header.len() >= 12 && matches!(&header[4..8], b"ftyp" | b"moov" | b"mdat" | b"wide") {
        return StreamMode::Mp4;
    }
    if header.len() >= 4 && header[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return StreamMode::Matroska;
    }
    if header.len() >= 3 && header[..3] == [0xCC, 0xCC, 0xED] {
        return StreamMode::Rcwt;
    }
    if header.len() >= 6 && header[..6] == [0x00, 0x00, 0x00, 0x00, 0x01, 0xBC] {
        return StreamMode::Gxf;
    }
    if header.len() >= 4 && header[..4] == [0x00, 0x00, 0x01, 0xBA] {
        return StreamMode::MpegPs;
    }
    if header.len() >= 188 * 2 + 1
        && header[0] == 0x47
        && header[188] == 0x47
        && header[188 * 2] == 0x47
    {
        return StreamMode::MpegTs;
    }
    StreamMode::ElementaryStream
}

/// One chunk of decode-stream bytes handed up by a demuxer.
#[derive(Debug)]
pub struct DemuxPayload {
    pub buf: bytes::BytesMut,
    pub pts: Option<Mts>,
    pub data_type: BufferDataType,
    pub stream_id: u8,
}

/// Strips an MPEG-2 video PES header, returning the elementary-stream bytes.
/// Returns `None` when the buffer is not a video PES packet.
pub fn strip_pes_header(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < 9 || buf[0] != 0x00 || buf[1] != 0x00 || buf[2] != 0x01 {
        return None;
    }
    if !(0xE0..=0xEF).contains(&buf[3]) {
        return None;
    }
    if buf[6] & 0xC0 != 0x80 {
        // Not an MPEG-2 style PES header.
        return None;
    }
    let header_data_length = buf[8] as usize;
    buf.get(9 + header_data_length..)
}

/// Parser state shared by every container driver: the NAL/MPEG-2 extractors,
/// timing, and the display-order sequencer.
pub struct Pipeline {
    pub opts: Options,
    pub timing: Timing,
    pub seqr: Sequencer,
    pub avc: AvcContext,
    pub hevc: HevcContext,
    pub m2v: M2vContext,
    /// Selected by the container's codec information (hev1/hvc1 tracks).
    pub is_hevc: bool,
}

impl Pipeline {
    pub fn new(opts: &Options, policy: StorePolicy) -> Self {
        Pipeline {
            opts: opts.clone(),
            timing: Timing::new(opts.ignore_pts_jumps),
            seqr: Sequencer::new(policy, opts.use_gop_as_pts),
            avc: AvcContext::new(),
            hevc: HevcContext::new(),
            m2v: M2vContext::new(),
            is_hevc: false,
        }
    }

    /// Routes one NAL unit to the AVC or HEVC handler.
    pub fn do_nal(
        &mut self,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
        nal: &mut [u8],
    ) -> Result<(), Error> {
        if self.is_hevc {
            self.hevc.do_nal(&mut self.avc, nal)
        } else {
            self.avc.do_nal(
                &mut self.timing,
                &mut self.seqr,
                &self.opts,
                sink,
                data_type,
                nal,
            )
        }
    }

    /// Emits whatever is still buffered at end of input.
    pub fn finish(
        &mut self,
        sink: &mut dyn CaptionSink,
        data_type: BufferDataType,
    ) -> Result<(), Error> {
        if self.avc.cc_count > 0 {
            self.hevc.flush_sample(
                &mut self.avc,
                &mut self.timing,
                &mut self.seqr,
                sink,
                data_type,
            )?;
        }
        if self.seqr.has_buffered() {
            self.seqr.process(sink, data_type)?;
        }
        sink.flush()
    }
}

// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The caption byte contract with the external 608/708 decoders.
//!
//! The core produces contiguous runs of 3-byte tuples `{cc_info, data1,
//! data2}` plus a frame timestamp; a [`CaptionSink`] consumes them. The
//! full-featured serializers (SRT, SCC, MCC, transcripts with actual 608
//! decoding) are external collaborators; the writers here cover the raw
//! interchange formats.

use base::time::MsTime;
use base::Error;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// How the bytes handed to the decoder are laid out.
///
/// `Raw` is bare 608 byte pairs (DVR-MS NTSC caption streams). `Pes` rides in
/// an MPEG-2 video elementary stream. `H264` is SEI/CDP-style cc triples; for
/// these the container PTS anchors each block exactly, so the decoder must
/// not advance its per-field block counters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferDataType {
    Raw,
    Pes,
    H264,
}

/// One cc_data triple as carried in a CDP or SEI message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CcTriple {
    pub cc_info: u8,
    pub data: [u8; 2],
}

impl CcTriple {
    pub fn cc_valid(self) -> bool {
        self.cc_info & 0x04 != 0
    }

    /// 0/1 are NTSC field pairs, 2/3 carry DTVCC packet data.
    pub fn cc_type(self) -> u8 {
        self.cc_info & 0x03
    }
}

/// Where the extracted caption bytes go. This is the boundary to the external
/// 608/708 decoders and encoders.
pub trait CaptionSink {
    /// Delivers a run of 3-byte caption tuples (or raw 608 pairs for
    /// `BufferDataType::Raw`) stamped with a frame timestamp.
    fn cc_data(&mut self, fts: MsTime, data_type: BufferDataType, data: &[u8])
        -> Result<(), Error>;

    /// Delivers a decoded text subtitle (tx3g). The end time is unknown until
    /// the next subtitle arrives.
    fn text_subtitle(
        &mut self,
        start: MsTime,
        end: Option<MsTime>,
        text: &str,
    ) -> Result<(), Error>;

    /// Called by the sequencer between display-order slots for H.264 layout
    /// data, where the container timestamps anchor blocks exactly and any
    /// block counting must restart.
    fn reset_block_counters(&mut self) {}

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Writes the binary interchange dump: an 11-byte header, then per emission a
/// little-endian ms timestamp, a 16-bit tuple count, and the tuples.
pub struct BinaryDumpWriter<W: Write> {
    out: W,
    header_written: bool,
}

const BINARY_DUMP_HEADER: [u8; 11] = [
    0xCC, 0xCC, 0xED, // magic
    0x00, 0x50, // writer program
    0x00, 0x60, // writer version
    0x00, 0x01, // format version
    0x00, 0x00, // reserved
];

impl<W: Write> BinaryDumpWriter<W> {
    pub fn new(out: W) -> Self {
        BinaryDumpWriter {
            out,
            header_written: false,
        }
    }
}

impl<W: Write> CaptionSink for BinaryDumpWriter<W> {
    fn cc_data(
        &mut self,
        fts: MsTime,
        _data_type: BufferDataType,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            self.out.write_all(&BINARY_DUMP_HEADER)?;
            self.header_written = true;
        }
        self.out.write_i64::<LittleEndian>(fts.0)?;
        self.out.write_u16::<LittleEndian>((data.len() / 3) as u16)?;
        self.out.write_all(data)?;
        Ok(())
    }

    fn text_subtitle(
        &mut self,
        _start: MsTime,
        _end: Option<MsTime>,
        _text: &str,
    ) -> Result<(), Error> {
        // Text subtitles have no representation in the binary dump.
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes a human-readable dump: one line per emission with the timestamp and
/// hex bytes, and bracketed time ranges for text subtitles.
pub struct TextDumpWriter<W: Write> {
    out: W,
}

impl<W: Write> TextDumpWriter<W> {
    pub fn new(out: W) -> Self {
        TextDumpWriter { out }
    }
}

impl<W: Write> CaptionSink for TextDumpWriter<W> {
    fn cc_data(
        &mut self,
        fts: MsTime,
        data_type: BufferDataType,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let kind = match data_type {
            BufferDataType::Raw => "608",
            BufferDataType::Pes => "pes",
            BufferDataType::H264 => "ccd",
        };
        write!(self.out, "{fts} {kind} |")?;
        for b in data {
            write!(self.out, " {b:02X}")?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    fn text_subtitle(
        &mut self,
        start: MsTime,
        end: Option<MsTime>,
        text: &str,
    ) -> Result<(), Error> {
        match end {
            Some(end) => writeln!(self.out, "[{start} --> {end}] {text}")?,
            None => writeln!(self.out, "[{start} --> ?] {text}")?,
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cc_triple_fields() {
        let t = CcTriple {
            cc_info: 0xFC,
            data: [0x94, 0x20],
        };
        assert!(t.cc_valid());
        assert_eq!(t.cc_type(), 0);
        let t = CcTriple {
            cc_info: 0xFE,
            data: [0x01, 0x02],
        };
        assert_eq!(t.cc_type(), 2);
    }

    #[test]
    fn binary_dump_framing() {
        let mut buf = Vec::new();
        {
            let mut w = BinaryDumpWriter::new(&mut buf);
            w.cc_data(MsTime(0x1234), BufferDataType::H264, &[0xFC, 0x94, 0x20])
                .unwrap();
        }
        assert_eq!(&buf[..11], &BINARY_DUMP_HEADER);
        assert_eq!(&buf[11..19], &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[19..21], &[1, 0]);
        assert_eq!(&buf[21..], &[0xFC, 0x94, 0x20]);
    }

    #[test]
    fn binary_dump_skips_empty() {
        let mut buf = Vec::new();
        {
            let mut w = BinaryDumpWriter::new(&mut buf);
            w.cc_data(MsTime(0), BufferDataType::Raw, &[]).unwrap();
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn text_dump_lines() {
        let mut buf = Vec::new();
        {
            let mut w = TextDumpWriter::new(&mut buf);
            w.cc_data(MsTime(1_500), BufferDataType::Raw, &[0x94, 0x20])
                .unwrap();
            w.text_subtitle(MsTime(0), Some(MsTime(2_000)), "hello").unwrap();
        }
        let s = String::from_utf8(buf).unwrap();
        assert_eq!(
            s,
            "00:00:01:500 608 | 94 20\n[00:00:00:000 --> 00:00:02:000] hello\n"
        );
    }
}

// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! ASF (and DVR-MS, its recorded-TV extension) demultiplexing.
//!
//! An ASF file is a Header Object (stream inventory), a Data Object header,
//! and a long run of data packets, each carrying one or more payloads of one
//! media object. [`AsfDemuxer::open`] parses the header objects once and
//! picks the stream captions will be decoded from; each
//! [`AsfDemuxer::get_more_data`] call then returns one complete media object
//! from that stream, resuming mid-packet across calls.
//!
//! Field layouts follow the ASF specification sections 10.1-10.4; DVR-MS adds
//! a payload extension carrying 100 ns presentation timestamps.

use crate::caption::BufferDataType;
use crate::demux::{ByteSource, DemuxPayload};
use crate::options::Options;
use crate::timing::Timing;
use base::time::{MsTime, Mts, TIME_UNITS_PER_MS};
use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Write as _;
use tracing::{debug, info};

pub const ASF_HEADER_GUID: [u8; 16] = *b"\x30\x26\xB2\x75\x8E\x66\xCF\x11\xA6\xD9\x00\xAA\x00\x62\xCE\x6C";
const ASF_DATA: [u8; 16] = *b"\x36\x26\xB2\x75\x8E\x66\xCF\x11\xA6\xD9\x00\xAA\x00\x62\xCE\x6C";

const ASF_FILE_PROPERTIES: [u8; 16] = *b"\xA1\xDC\xAB\x8C\x47\xA9\xCF\x11\x8E\xE4\x00\xC0\x0C\x20\x53\x65";
const ASF_STREAM_PROPERTIES: [u8; 16] = *b"\x91\x07\xDC\xB7\xB7\xA9\xCF\x11\x8E\xE6\x00\xC0\x0C\x20\x53\x65";
const ASF_HEADER_EXTENSION: [u8; 16] = *b"\xB5\x03\xBF\x5F\x2E\xA9\xCF\x11\x8E\xE3\x00\xC0\x0C\x20\x53\x65";
const ASF_CONTENT_DESCRIPTION: [u8; 16] = *b"\x33\x26\xB2\x75\x8E\x66\xCF\x11\xA6\xD9\x00\xAA\x00\x62\xCE\x6C";
const ASF_EXTENDED_CONTENT_DESCRIPTION: [u8; 16] = *b"\x40\xA4\xD0\xD2\x07\xE3\xD2\x11\x97\xF0\x00\xA0\xC9\x5E\xA8\x50";
const ASF_STREAM_BITRATE_PROPERTIES: [u8; 16] = *b"\xCE\x75\xF8\x7B\x8D\x46\xD1\x11\x8D\x82\x00\x60\x97\xC9\xA2\xB2";
const ASF_EXTENDED_STREAM_PROPERTIES: [u8; 16] = *b"\xCB\xA5\xE6\x14\x72\xC6\x32\x43\x83\x99\xA9\x69\x52\x06\x5B\x5A";
const ASF_METADATA: [u8; 16] = *b"\xEA\xCB\xF8\xC5\xAF\x5B\x77\x48\x84\x67\xAA\x8C\x44\xFA\x4C\xCA";
const ASF_METADATA_LIBRARY: [u8; 16] = *b"\x94\x1C\x23\x44\x98\x94\xD1\x49\xA1\x41\x1D\x13\x4E\x45\x70\x54";
const ASF_COMPATIBILITY2: [u8; 16] = *b"\x5D\x8B\xF1\x26\x84\x45\xEC\x47\x9F\x5F\x0E\x65\x1F\x04\x52\xC9";
const ASF_PADDING: [u8; 16] = *b"\x74\xD4\x06\x18\xDF\xCA\x09\x45\xA4\xBA\x9A\xAB\xCB\x96\xAA\xE8";

const ASF_AUDIO_MEDIA: [u8; 16] = *b"\x40\x9E\x69\xF8\x4D\x5B\xCF\x11\xA8\xFD\x00\x80\x5F\x5C\x44\x2B";
const ASF_VIDEO_MEDIA: [u8; 16] = *b"\xC0\xEF\x19\xBC\x4D\x5B\xCF\x11\xA8\xFD\x00\x80\x5F\x5C\x44\x2B";
const ASF_BINARY_MEDIA: [u8; 16] = *b"\xE2\x65\xFB\x3A\xEF\x47\xF2\x40\xAC\x2C\x70\xA9\x0D\x71\xD3\x43";

// Major media types inside binary streams; DVR-MS identifies its streams this way.
const DVRMS_AUDIO: [u8; 16] = *b"\x9D\x8C\x17\x31\xE1\x03\x28\x45\xB5\x82\x3D\xF9\xDB\x22\xF5\x03";
const DVRMS_NTSC: [u8; 16] = *b"\x80\xEA\x0A\x67\x82\x3A\xD0\x11\xB7\x9B\x00\xAA\x00\x37\x67\xA7";
const DVRMS_ATSC: [u8; 16] = *b"\x89\x8A\x8B\xB8\x49\xB0\x80\x4C\xAD\xCF\x58\x98\x98\x5E\x22\xC1";

// Undocumented DVR-MS payload extension carrying 100 ns timestamps.
const DVRMS_PTS: [u8; 16] = *b"\x2A\xC0\x3C\xFD\xDB\x06\xFA\x4C\x80\x1C\x72\x12\xD3\x87\x45\xE4";

/// Streams an ASF file may declare; raise if a real file exceeds it.
pub const STREAM_LIMIT: usize = 10;
/// Payload extension systems per stream; raise if a real file exceeds it.
pub const PAYLOAD_EXT_LIMIT: usize = 10;

/// A video timeline gap larger than this is a discontinuity, not jitter.
const VIDEO_JUMP_MS: i32 = 500;

/// Decodes an ASF length-type code: {none, byte, word, dword} stored widths.
fn type_length(code: u8) -> u8 {
    if code == 3 {
        4
    } else {
        code
    }
}

/// Reads a variable-width little-endian value of `ltype` bytes (0 means the
/// field is absent and reads as 0).
fn read_var(buf: &[u8], ltype: u8) -> u32 {
    match ltype {
        0 => 0,
        1 => u32::from(buf[0]),
        2 => u32::from(LittleEndian::read_u16(buf)),
        4 => LittleEndian::read_u32(buf),
        _ => unreachable!("type_length yields 0/1/2/4"),
    }
}

/// Formats a GUID the way ASF tooling prints them.
fn format_guid(g: &[u8]) -> String {
    let mut s = String::with_capacity(36);
    let _ = write!(
        s,
        "{:08X}-{:04X}-{:04X}-",
        LittleEndian::read_u32(&g[0..4]),
        LittleEndian::read_u16(&g[4..6]),
        LittleEndian::read_u16(&g[6..8]),
    );
    for b in &g[8..10] {
        let _ = write!(s, "{b:02X}");
    }
    s.push('-');
    for b in &g[10..16] {
        let _ = write!(s, "{b:02X}");
    }
    s
}

/// Returns true when `name` is the UTF-16LE encoding of `expected`
/// (optionally nul-terminated).
fn utf16le_name_eq(name: &[u8], expected: &str) -> bool {
    let enc: Vec<u8> = expected
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    if name.len() < enc.len() {
        return false;
    }
    name[..enc.len()] == enc[..] && name[enc.len()..].iter().all(|&b| b == 0)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaptionStyle {
    Ntsc,
    Atsc,
}

/// Stream inventory and policy decisions from the header objects.
#[derive(Debug)]
pub struct AsfHeader {
    pub header_object_size: i64,
    pub file_size: i64,
    pub data_packets_count: i64,
    /// Set when MinimumDataPacketSize == MaximumDataPacketSize; the fallback
    /// when a packet declares no length of its own.
    pub packet_size: u32,

    pub video_stream: u8,
    pub audio_stream: u8,
    pub caption_stream: u8,
    pub caption_style: Option<CaptionStyle>,
    /// The stream caption bytes will be taken from.
    pub decode_stream: u8,
    pub data_type: BufferDataType,
    /// `WM/VideoClosedCaptioning`, informational only; it is not reliable.
    pub video_closed_captioning_flag: Option<i32>,

    pub data_object_size: i64,
    pub total_data_packets: u32,

    /// Payload extension system data sizes, per stream and entry.
    payload_ext_size: [[u32; PAYLOAD_EXT_LIMIT]; STREAM_LIMIT],
    /// Which extension entry carries the DVR-MS PTS, per stream (-1 = none).
    payload_ext_pts_entry: [i32; STREAM_LIMIT],
}

impl AsfHeader {
    fn pts_entry(&self, stream: u8) -> i32 {
        self.payload_ext_pts_entry
            .get(stream as usize)
            .copied()
            .unwrap_or(-1)
    }
}

/// Per-stream timing bookkeeping across payloads.
#[derive(Default, Debug)]
struct StreamClock {
    /// Next value to return for a decode-stream block, in ms.
    decode_stream_pts: i32,
    /// PTS of the media object currently being returned / the previous one.
    curr_decode_stream_pts: i32,
    prev_decode_stream_pts: i32,
    video_stream_ms: i32,
    curr_video_stream_ms: i32,
    prev_video_stream_ms: i32,
    /// A >500 ms jump in the video timeline, remembered until the next
    /// caption block.
    video_jump: bool,
}

/// The ASF data-packet state machine. All re-entry state is explicit here;
/// each `get_more_data` call resumes exactly where the previous one stopped.
#[derive(Debug)]
pub struct AsfDemuxer {
    pub header: AsfHeader,
    clock: StreamClock,

    scratch: Vec<u8>,
    eof: bool,

    // Data-packet loop position.
    datapacket_cur: u32,
    dobject_read: i64,

    // Per-packet state that survives a mid-packet return.
    resuming: bool,
    multiple_payloads: bool,
    packet_l_type: u8,
    replicated_l_type: u8,
    offset_media_l_type: u8,
    media_number_l_type: u8,
    packet_length: u32,
    padding_length: u32,
    payload_l_type: u8,
    payload_length: u32,
    number_of_payloads: u32,
    payload_cur: u32,
    payload_stream_number: u8,
    key_frame: bool,
    payload_media_number: u32,
    /// Header bytes consumed so far in this packet, for inferring the length
    /// of a single payload.
    data_packet_length: u32,
}

impl AsfDemuxer {
    /// Reads the Header Object and the Data Object header (phases A and B).
    ///
    /// Returns `Ok(None)` on a file too short to contain them.
    pub fn open(src: &mut dyn ByteSource, opts: &Options) -> Result<Option<Self>, Error> {
        let mut scratch = vec![0u8; 1024];
        if src.read(&mut scratch[..30])? != 30 {
            info!("premature end of file");
            return Ok(None);
        }
        if scratch[..16] != ASF_HEADER_GUID {
            bail!(DataLoss, msg("missing ASF header, cannot read this file"));
        }
        let header_object_size = LittleEndian::read_i64(&scratch[16..24]);
        debug!(
            target: "ccdemux::parse",
            "ASF header: length {header_object_size}, {} header objects",
            LittleEndian::read_u32(&scratch[24..28])
        );
        if !(30..=i64::MAX / 2).contains(&header_object_size) {
            bail!(DataLoss, msg("nonsensical ASF HeaderObjectSize {header_object_size}"));
        }
        if header_object_size as usize > scratch.len() {
            scratch.resize(header_object_size as usize, 0);
        }
        let rest = header_object_size as usize - 30;
        if src.read(&mut scratch[30..30 + rest])? != rest {
            info!("premature end of file");
            return Ok(None);
        }

        let mut header = AsfHeader {
            header_object_size,
            file_size: 0,
            data_packets_count: 0,
            packet_size: 0,
            video_stream: 0,
            audio_stream: 0,
            caption_stream: 0,
            caption_style: None,
            decode_stream: 0,
            data_type: BufferDataType::Pes,
            video_closed_captioning_flag: None,
            data_object_size: 0,
            total_data_packets: 0,
            payload_ext_size: [[0; PAYLOAD_EXT_LIMIT]; STREAM_LIMIT],
            payload_ext_pts_entry: [-1; STREAM_LIMIT],
        };
        let mut min_packet_size = 0u32;
        let mut max_packet_size = 0u32;
        parse_header_objects(
            &scratch[..header_object_size as usize],
            &mut header,
            &mut min_packet_size,
            &mut max_packet_size,
        )?;

        if header.video_stream == 0 {
            bail!(
                DataLoss,
                msg("no Video Stream Properties Object found, unable to continue")
            );
        }

        // Decide where to expect the captions.
        header.data_type = BufferDataType::Pes; // except for NTSC captions
        let style = header.caption_style;
        if header.caption_stream > 0
            && (style == Some(CaptionStyle::Ntsc)
                || (style == Some(CaptionStyle::Atsc) && !opts.wtv_convert_fix))
        {
            info!(
                "if this file came from a WTV conversion and no captions are found, \
                 try --wtv-convert-fix"
            );
        }
        if header.caption_stream > 0
            && (style == Some(CaptionStyle::Ntsc)
                || (style == Some(CaptionStyle::Atsc) && opts.wtv_convert_fix))
        {
            info!("NTSC captions in stream #{}", header.caption_stream);
            header.data_type = BufferDataType::Raw;
            header.decode_stream = header.caption_stream;
        } else if header.caption_stream > 0 && style == Some(CaptionStyle::Atsc) {
            info!(
                "ATSC captions (probably) in stream #{}; decoding the video stream #{} instead",
                header.caption_stream, header.video_stream
            );
            header.decode_stream = header.video_stream;
        } else {
            header.decode_stream = header.video_stream;
            info!(
                "assuming CC info is in video stream #{} (no caption stream found)",
                header.decode_stream
            );
        }

        // A packet with Packet Length Type 0 falls back to the global size.
        if min_packet_size > 0 && min_packet_size == max_packet_size {
            header.packet_size = min_packet_size;
        }

        // Phase B: the Data Object header, except for the packets.
        if src.read(&mut scratch[..50])? != 50 {
            info!("premature end of file");
            return Ok(None);
        }
        if scratch[..16] != ASF_DATA {
            bail!(DataLoss, msg("missing ASF Data Object"));
        }
        header.data_object_size = LittleEndian::read_i64(&scratch[16..24]);
        header.total_data_packets = LittleEndian::read_u32(&scratch[40..44]);
        debug!(
            target: "ccdemux::parse",
            "ASF Data Object: size {} packets {}",
            header.data_object_size,
            header.total_data_packets
        );

        Ok(Some(AsfDemuxer {
            header,
            clock: StreamClock::default(),
            scratch,
            eof: false,
            datapacket_cur: 0,
            dobject_read: 50,
            resuming: false,
            multiple_payloads: false,
            packet_l_type: 0,
            replicated_l_type: 0,
            offset_media_l_type: 0,
            media_number_l_type: 0,
            packet_length: 0,
            padding_length: 0,
            payload_l_type: 0,
            payload_length: 0,
            number_of_payloads: 0,
            payload_cur: 0,
            payload_stream_number: 0,
            key_frame: false,
            payload_media_number: 0,
            data_packet_length: 0,
        }))
    }

    /// Reads exactly `n` bytes into the scratch buffer. A short read logs,
    /// latches EOF, and returns false.
    fn fill(&mut self, src: &mut dyn ByteSource, n: usize) -> Result<bool, Error> {
        if self.scratch.len() < n {
            self.scratch.resize(n, 0);
        }
        let got = src.read(&mut self.scratch[..n])?;
        self.dobject_read += got as i64;
        if got != n {
            info!("premature end of file");
            self.eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    /// Phase C: returns the next complete media object of the decode stream,
    /// or `None` at end of file. `timing.disable_sync_check` is toggled when
    /// caption and video timelines legitimately diverge.
    pub fn get_more_data(
        &mut self,
        src: &mut dyn ByteSource,
        timing: &mut Timing,
    ) -> Result<Option<DemuxPayload>, Error> {
        if self.eof {
            return Ok(None);
        }
        let mut out = DemuxPayload {
            buf: bytes::BytesMut::new(),
            pts: None,
            data_type: self.header.data_type,
            stream_id: self.header.decode_stream,
        };
        // Marks the media object being accumulated; a change ends the call.
        let mut current_media_number: Option<u32> = None;
        let mut resuming = std::mem::take(&mut self.resuming);
        let mut enough = false;

        while self.datapacket_cur < self.header.total_data_packets && !enough {
            if !resuming {
                debug!(
                    target: "ccdemux::parse",
                    "reading packet {}/{}",
                    self.datapacket_cur + 1,
                    self.header.total_data_packets
                );
                if !self.read_packet_header(src)? {
                    return Ok(none_if_empty(out));
                }
            }

            while self.payload_cur < self.number_of_payloads && !enough {
                if !resuming {
                    if !self.read_payload_header(src, timing)? {
                        return Ok(none_if_empty(out));
                    }
                }
                resuming = false;

                // Video streams need several payloads to complete a PES;
                // leave when the next payload starts a new media object.
                if let Some(current) = current_media_number {
                    if self.payload_stream_number == self.header.decode_stream
                        && self.payload_media_number != current
                    {
                        debug!(
                            target: "ccdemux::parse",
                            "{} stream object read with PTS {}",
                            if self.header.decode_stream == self.header.caption_stream {
                                "caption"
                            } else {
                                "video"
                            },
                            MsTime(self.clock.curr_decode_stream_pts as i64),
                        );
                        enough = true;
                        self.resuming = true;
                        break;
                    }
                }

                if self.payload_stream_number == self.header.decode_stream {
                    current_media_number = Some(self.payload_media_number);
                    debug!(
                        target: "ccdemux::parse",
                        "reading stream #{} data", self.payload_stream_number
                    );
                    out.pts = Some(Mts(
                        self.clock.curr_decode_stream_pts as i64 * TIME_UNITS_PER_MS
                    ));
                    let want = self.payload_length as usize;
                    let old_len = out.buf.len();
                    out.buf.resize(old_len + want, 0);
                    let got = src.read(&mut out.buf[old_len..])?;
                    self.dobject_read += got as i64;
                    if got != want {
                        info!("premature end of file");
                        self.eof = true;
                        out.buf.truncate(old_len + got);
                        return Ok(none_if_empty(out));
                    }
                } else {
                    debug!(
                        target: "ccdemux::parse",
                        "skipping stream #{} data", self.payload_stream_number
                    );
                    let got = src.skip(self.payload_length as u64)?;
                    self.dobject_read += got as i64;
                    if got != u64::from(self.payload_length) {
                        info!("premature end of file");
                        self.eof = true;
                        return Ok(none_if_empty(out));
                    }
                }
                self.payload_cur += 1;
            }
            if enough {
                break;
            }

            debug!(target: "ccdemux::parse", "skip {} padding", self.padding_length);
            let got = src.skip(u64::from(self.padding_length))?;
            self.dobject_read += got as i64;
            if got != u64::from(self.padding_length) {
                info!("premature end of file");
                self.eof = true;
                return Ok(none_if_empty(out));
            }
            self.datapacket_cur += 1;
            debug!(
                target: "ccdemux::parse",
                "bytes read: {}/{}", self.dobject_read, self.header.data_object_size
            );
        }

        if self.datapacket_cur == self.header.total_data_packets && !enough {
            debug!(target: "ccdemux::parse", "read the last packet");
            // Skip the rest of the file. Do not latch EOF for this; it would
            // read as a premature-end error.
            let rest = self.header.file_size
                - self.header.header_object_size
                - self.header.data_object_size;
            if rest > 0 {
                debug!(target: "ccdemux::parse", "skipping trailing {rest} bytes");
                src.skip(rest as u64)?;
            }
            if out.buf.is_empty() {
                self.eof = true;
            }
        }
        Ok(none_if_empty(out))
    }

    /// Reads the error-correction data and payload parsing information at the
    /// top of a data packet.
    fn read_packet_header(&mut self, src: &mut dyn ByteSource) -> Result<bool, Error> {
        self.data_packet_length = 0;
        if !self.fill(src, 1)? {
            return Ok(false);
        }
        self.data_packet_length += 1;
        let first = self.scratch[0];
        let ppi0;
        if first & 0x80 != 0 {
            // Error correction data precedes the payload parsing info.
            let ec_len = (first & 0x0F) as usize;
            if first & 0x60 != 0 {
                bail!(
                    Unimplemented,
                    msg("ASF Error Correction Length Type not 0 (reserved), aborting")
                );
            }
            if !self.fill(src, ec_len)? {
                return Ok(false);
            }
            if ec_len > 0 && self.scratch[0] & 0x0F != 0 {
                bail!(Unimplemented, msg("ASF error correction present, unable to continue"));
            }
            self.data_packet_length += ec_len as u32;
            if !self.fill(src, 2)? {
                return Ok(false);
            }
            ppi0 = self.scratch[0];
            self.data_packet_length += 2;
        } else {
            // No error correction; that byte was the first payload parsing
            // information byte.
            ppi0 = first;
            if !self.fill(src, 1)? {
                return Ok(false);
            }
            self.data_packet_length += 1;
        }
        let ppi1 = self.scratch[if first & 0x80 != 0 { 1 } else { 0 }];

        self.multiple_payloads = ppi0 & 0x01 != 0;
        let sequence_type = type_length((ppi0 >> 1) & 0x03);
        let padding_l_type = type_length((ppi0 >> 3) & 0x03);
        self.packet_l_type = type_length((ppi0 >> 5) & 0x03);
        self.replicated_l_type = type_length(ppi1 & 0x03);
        self.offset_media_l_type = type_length((ppi1 >> 2) & 0x03);
        self.media_number_l_type = type_length((ppi1 >> 4) & 0x03);
        // Bits 6..7 are the stream-number length type; the stream number
        // always lives in the payload flag byte, so it goes unused.

        // packet length + sequence + padding length + send time + duration.
        let parser_size =
            (self.packet_l_type + sequence_type + padding_l_type) as usize + 6;
        if !self.fill(src, parser_size)? {
            return Ok(false);
        }
        self.data_packet_length += parser_size as u32;

        let mut pos = 0usize;
        self.packet_length = read_var(&self.scratch[pos..], self.packet_l_type);
        pos += self.packet_l_type as usize;
        let sequence = read_var(&self.scratch[pos..], sequence_type);
        pos += sequence_type as usize;
        self.padding_length = read_var(&self.scratch[pos..], padding_l_type);
        pos += padding_l_type as usize;
        // The data packet's ms send time; payload presentation times are
        // what matter for captions.
        let _send_time = LittleEndian::read_u32(&self.scratch[pos..]);

        // If the packet declares no length, use the global packet size.
        if self.packet_length == 0 {
            self.packet_length = self.header.packet_size;
            // Multiple payloads carry individual lengths, so only a single
            // payload is unrecoverable.
            if self.packet_length == 0 && !self.multiple_payloads {
                bail!(
                    Unimplemented,
                    msg("cannot determine ASF packet length, unable to continue")
                );
            }
        }
        debug!(
            target: "ccdemux::parse",
            "lengths: packet {} / sequence {sequence} / padding {}",
            self.packet_length,
            self.padding_length
        );

        self.payload_l_type = 0;
        self.payload_length = 0;
        self.number_of_payloads = 1;
        if self.multiple_payloads {
            if !self.fill(src, 1)? {
                return Ok(false);
            }
            self.data_packet_length += 1;
            let b = self.scratch[0];
            self.payload_l_type = type_length((b >> 6) & 0x03);
            self.number_of_payloads = u32::from(b & 0x3F);
        }
        self.payload_cur = 0;
        Ok(true)
    }

    /// Reads one payload's header and replicated data, updating the stream
    /// clocks.
    fn read_payload_header(
        &mut self,
        src: &mut dyn ByteSource,
        timing: &mut Timing,
    ) -> Result<bool, Error> {
        if self.number_of_payloads < 2 {
            debug!(target: "ccdemux::parse", "single payload");
        } else {
            debug!(
                target: "ccdemux::parse",
                "multiple payloads {}/{}",
                self.payload_cur + 1,
                self.number_of_payloads
            );
        }
        let header_size = 1
            + (self.media_number_l_type + self.offset_media_l_type + self.replicated_l_type)
                as usize;
        if !self.fill(src, header_size)? {
            return Ok(false);
        }
        self.data_packet_length += header_size as u32;

        self.payload_stream_number = self.scratch[0] & 0x7F;
        self.key_frame = self.scratch[0] & 0x80 != 0;
        let mut pos = 1usize;
        self.payload_media_number = read_var(&self.scratch[pos..], self.media_number_l_type);
        pos += self.media_number_l_type as usize;
        let offset_media_length = read_var(&self.scratch[pos..], self.offset_media_l_type);
        pos += self.offset_media_l_type as usize;
        let replicated_length = read_var(&self.scratch[pos..], self.replicated_l_type);

        if replicated_length == 1 {
            bail!(Unimplemented, msg("cannot handle compressed ASF payload data"));
        }
        if !self.fill(src, replicated_length as usize)? {
            return Ok(false);
        }
        self.data_packet_length += replicated_length;

        // Replicated data is at least 8 bytes (ASF section 7.3.1): the media
        // object size and its presentation time in ms.
        let mut media_object_size = 0u32;
        let mut presentation_time_ms = 0i32;
        let mut rt_start = 0i64; // DVR-MS 100 ns timestamps
        let mut rt_end = 0i64;
        if replicated_length >= 8 {
            media_object_size = LittleEndian::read_u32(&self.scratch[0..4]);
            presentation_time_ms = LittleEndian::read_i32(&self.scratch[4..8]);
            let rep = &self.scratch[..replicated_length as usize];
            let mut rep_pos = 8usize;
            // Walk the payload extension systems preceding the PTS entry.
            let stream = self.payload_stream_number as usize;
            let pts_entry = self.header.pts_entry(self.payload_stream_number);
            for i in 0..pts_entry.max(0) as usize {
                let declared = self
                    .header
                    .payload_ext_size
                    .get(stream)
                    .map(|sizes| sizes[i])
                    .unwrap_or(0);
                let ext_size = if declared == 0xFFFF {
                    // Variable-length entry, prefixed with its own length.
                    let s = rep
                        .get(rep_pos..rep_pos + 2)
                        .map(|b| u32::from(LittleEndian::read_u16(b)))
                        .unwrap_or(0);
                    rep_pos += 2;
                    s
                } else {
                    declared
                };
                rep_pos += ext_size as usize;
            }
            if pts_entry > 0 {
                if let Some(b) = rep.get(rep_pos + 8..rep_pos + 24) {
                    rt_start = LittleEndian::read_i64(&b[0..8]);
                    rt_end = LittleEndian::read_i64(&b[8..16]);
                }
            }
        }
        // Avoid problems with unset PTS times.
        if rt_start == -1 {
            rt_start = 0;
            rt_end = 0;
            debug!(target: "ccdemux::parse", "dvr-ms time not defined");
        }
        debug!(
            target: "ccdemux::parse",
            "stream #{}[{}] media #{} offset/size {}/{} payload time {} dvr-ms PTS {}+{}",
            self.payload_stream_number,
            self.key_frame as u8,
            self.payload_media_number,
            offset_media_length,
            media_object_size,
            MsTime(presentation_time_ms as i64),
            MsTime(rt_start / 10_000),
            (rt_end - rt_start) / 10_000,
        );

        // Only multiple-payload packets carry an explicit payload length.
        if self.multiple_payloads {
            let n = self.payload_l_type as usize;
            if !self.fill(src, n)? {
                return Ok(false);
            }
            self.payload_length = read_var(&self.scratch[..], self.payload_l_type);
        } else {
            self.payload_length = self
                .packet_length
                .saturating_sub(self.data_packet_length)
                .saturating_sub(self.padding_length);
        }
        debug!(
            target: "ccdemux::parse",
            "sizes: replicated {replicated_length} + payload {}",
            self.payload_length
        );

        let has_dvrms_pts = self.header.pts_entry(self.payload_stream_number) > 0;

        // Remember the last video timestamp, only when captions are separate
        // from the video stream.
        if self.payload_stream_number == self.header.video_stream
            && self.header.decode_stream != self.header.video_stream
            && offset_media_length == 0
        {
            self.clock.prev_video_stream_ms = self.clock.curr_video_stream_ms;
            self.clock.curr_video_stream_ms = self.clock.video_stream_ms;
            if has_dvrms_pts {
                // When rt_start is not set, keep the previous value.
                if rt_start > 0 {
                    self.clock.video_stream_ms = (rt_start / 10_000) as i32;
                }
            } else {
                // One ms extra so a 0 ms start time is not rejected.
                self.clock.video_stream_ms = presentation_time_ms + 1;
            }
            if (self.clock.curr_video_stream_ms - self.clock.prev_video_stream_ms).abs()
                > VIDEO_JUMP_MS
            {
                // Remembered until the next caption block.
                self.clock.video_jump = true;
            }
        }

        if self.payload_stream_number == self.header.decode_stream && offset_media_length == 0 {
            self.clock.prev_decode_stream_pts = self.clock.curr_decode_stream_pts;
            self.clock.curr_decode_stream_pts = self.clock.decode_stream_pts;
            if has_dvrms_pts {
                if rt_start > 0 {
                    self.clock.decode_stream_pts = (rt_start / 10_000) as i32;
                }
            } else {
                self.clock.decode_stream_pts = presentation_time_ms + 1;
            }

            // When captions ride a separate stream, a caption gap would look
            // like a PTS jump; only re-enable the sync check when the video
            // timeline actually jumped too.
            if self.header.decode_stream != self.header.video_stream {
                if self.clock.curr_decode_stream_pts - self.clock.prev_decode_stream_pts
                    > VIDEO_JUMP_MS
                {
                    timing.disable_sync_check = !self.clock.video_jump;
                }
                self.clock.video_jump = false;
            }
        }
        Ok(true)
    }
}

fn none_if_empty(out: DemuxPayload) -> Option<DemuxPayload> {
    if out.buf.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Walks the header sub-objects (phase A).
fn parse_header_objects(
    buf: &[u8],
    header: &mut AsfHeader,
    min_packet_size: &mut u32,
    max_packet_size: &mut u32,
) -> Result<(), Error> {
    let get = |range: std::ops::Range<usize>| -> Result<&[u8], Error> {
        buf.get(range)
            .ok_or_else(|| err!(DataLoss, msg("truncated ASF header object")))
    };
    let mut pos = 30usize;
    while pos < buf.len() {
        let guid = get(pos..pos + 16)?;
        let object_size = LittleEndian::read_i64(get(pos + 16..pos + 24)?);
        if object_size < 24 || pos as i64 + object_size > buf.len() as i64 {
            bail!(DataLoss, msg("ASF header sub-object overruns the Header Object"));
        }
        if guid == &ASF_FILE_PROPERTIES {
            // Mandatory object, only one.
            header.file_size = LittleEndian::read_i64(get(pos + 40..pos + 48)?);
            header.data_packets_count = LittleEndian::read_i64(get(pos + 56..pos + 64)?);
            let flags = get(pos + 88..pos + 89)?[0];
            *min_packet_size = LittleEndian::read_u32(get(pos + 92..pos + 96)?);
            *max_packet_size = LittleEndian::read_u32(get(pos + 96..pos + 100)?);
            debug!(
                target: "ccdemux::parse",
                "File Properties: size {} packets {} broadcast {} seekable {} \
                 packet size {}..{}",
                header.file_size,
                header.data_packets_count,
                flags & 0x1,
                (flags & 0x2) >> 1,
                min_packet_size,
                max_packet_size,
            );
        } else if guid == &ASF_STREAM_PROPERTIES {
            let media_type = get(pos + 24..pos + 40)?;
            let stream_number = get(pos + 72..pos + 73)?[0] & 0x7F;
            if media_type == &ASF_VIDEO_MEDIA {
                header.video_stream = stream_number;
                debug!(target: "ccdemux::parse", "video stream number: {stream_number}");
            } else if media_type == &ASF_AUDIO_MEDIA {
                header.audio_stream = stream_number;
                debug!(target: "ccdemux::parse", "audio stream number: {stream_number}");
            } else {
                debug!(
                    target: "ccdemux::parse",
                    "stream {stream_number} type {}", format_guid(media_type)
                );
            }
        } else if guid == &ASF_HEADER_EXTENSION {
            let data_size = LittleEndian::read_u32(get(pos + 42..pos + 46)?) as i64;
            if data_size != 0 {
                if data_size != object_size - 46 {
                    bail!(
                        DataLoss,
                        msg("incorrect HeaderExtensionDataSize value, cannot continue")
                    );
                }
                parse_header_extension(
                    buf,
                    pos + 46,
                    pos + 46 + data_size as usize,
                    header,
                )?;
            }
        } else if guid == &ASF_EXTENDED_CONTENT_DESCRIPTION {
            parse_extended_content_description(buf, pos, pos + object_size as usize, header)?;
        } else if guid == &ASF_CONTENT_DESCRIPTION
            || guid == &ASF_STREAM_BITRATE_PROPERTIES
            || guid == &ASF_PADDING
        {
            debug!(
                target: "ccdemux::parse",
                "skipping object {} (size {object_size})", format_guid(guid)
            );
        } else {
            debug!(
                target: "ccdemux::parse",
                "unknown header object {} (size {object_size})", format_guid(guid)
            );
        }
        pos += object_size as usize;
    }
    if pos != buf.len() {
        bail!(
            DataLoss,
            msg(
                "Header Object parsing problem: read bytes {pos} != header length {}",
                buf.len()
            )
        );
    }
    Ok(())
}

/// Walks the Header Extension sub-objects, in particular Extended Stream
/// Properties with the DVR-MS payload extension inventory.
fn parse_header_extension(
    buf: &[u8],
    start: usize,
    end: usize,
    header: &mut AsfHeader,
) -> Result<(), Error> {
    let get = |range: std::ops::Range<usize>| -> Result<&[u8], Error> {
        buf.get(range)
            .ok_or_else(|| err!(DataLoss, msg("truncated ASF header extension")))
    };
    let mut pos = start;
    while pos < end {
        let guid = get(pos..pos + 16)?;
        let object_size = LittleEndian::read_i64(get(pos + 16..pos + 24)?) as usize;
        if object_size < 24 || pos + object_size > end {
            bail!(DataLoss, msg("ASF header extension sub-object overruns its parent"));
        }
        if guid == &ASF_EXTENDED_STREAM_PROPERTIES {
            let stream_number =
                LittleEndian::read_u16(get(pos + 72..pos + 74)?) as usize;
            let stream_name_count = LittleEndian::read_u16(get(pos + 84..pos + 86)?);
            let payload_ext_count = LittleEndian::read_u16(get(pos + 86..pos + 88)?);
            debug!(
                target: "ccdemux::parse",
                "Extended Stream Properties: stream {stream_number} names {stream_name_count} \
                 extension systems {payload_ext_count}"
            );
            if stream_number >= STREAM_LIMIT {
                bail!(
                    OutOfRange,
                    msg("ASF stream number {stream_number} exceeds the supported limit")
                );
            }
            if payload_ext_count as usize > PAYLOAD_EXT_LIMIT {
                bail!(
                    OutOfRange,
                    msg("ASF payload extension count {payload_ext_count} exceeds the supported limit")
                );
            }
            let mut p = pos + 88;
            for _ in 0..stream_name_count {
                let name_len = LittleEndian::read_u16(get(p + 2..p + 4)?) as usize;
                p += 4 + name_len;
            }
            for i in 0..payload_ext_count as usize {
                let ext_guid = get(p..p + 16)?;
                let data_size = LittleEndian::read_u16(get(p + 16..p + 18)?);
                let info_len = LittleEndian::read_u32(get(p + 18..p + 22)?) as usize;
                header.payload_ext_size[stream_number][i] = u32::from(data_size);
                debug!(
                    target: "ccdemux::parse",
                    "{i}. payload extension {} size {data_size} info length {info_len}",
                    format_guid(ext_guid)
                );
                if ext_guid == &DVRMS_PTS {
                    debug!(target: "ccdemux::parse", "found DVR-MS PTS extension");
                    header.payload_ext_pts_entry[stream_number] = i as i32;
                }
                p += 22 + info_len;
            }
            // An optional inner Stream Properties Object follows; the only
            // way to find out is to check for remaining bytes.
            if p - pos < object_size {
                let inner_guid = get(p..p + 16)?;
                if inner_guid != &ASF_STREAM_PROPERTIES {
                    bail!(DataLoss, msg("Stream Properties Object expected"));
                }
                let media_type = get(p + 24..p + 40)?;
                if media_type == &ASF_VIDEO_MEDIA {
                    header.video_stream = stream_number as u8;
                    debug!(target: "ccdemux::parse", "stream {stream_number}: video");
                } else if media_type == &ASF_AUDIO_MEDIA {
                    header.audio_stream = stream_number as u8;
                    debug!(target: "ccdemux::parse", "stream {stream_number}: audio");
                } else if media_type == &ASF_BINARY_MEDIA {
                    // DVR-MS identifies its streams by the major media type
                    // inside the binary stream's type-specific data.
                    let major = get(p + 78..p + 94)?;
                    if major == &DVRMS_AUDIO {
                        debug!(target: "ccdemux::parse", "stream {stream_number}: DVR-MS audio");
                    } else if major == &DVRMS_NTSC {
                        debug!(target: "ccdemux::parse", "stream {stream_number}: NTSC captions");
                        header.caption_stream = stream_number as u8;
                        header.caption_style = Some(CaptionStyle::Ntsc);
                    } else if major == &DVRMS_ATSC {
                        debug!(target: "ccdemux::parse", "stream {stream_number}: ATSC captions");
                        header.caption_stream = stream_number as u8;
                        header.caption_style = Some(CaptionStyle::Atsc);
                    } else {
                        debug!(
                            target: "ccdemux::parse",
                            "stream {stream_number}: binary media {}", format_guid(major)
                        );
                    }
                } else {
                    debug!(
                        target: "ccdemux::parse",
                        "stream {stream_number}: unknown type {}", format_guid(media_type)
                    );
                }
            }
        } else if guid == &ASF_METADATA
            || guid == &ASF_METADATA_LIBRARY
            || guid == &ASF_COMPATIBILITY2
            || guid == &ASF_PADDING
        {
            debug!(
                target: "ccdemux::parse",
                "skipping header extension object {}", format_guid(guid)
            );
        } else {
            debug!(
                target: "ccdemux::parse",
                "unknown header extension object {} (size {object_size})", format_guid(guid)
            );
        }
        pos += object_size;
    }
    if pos != end {
        bail!(
            DataLoss,
            msg("Header Extension parsing problem: read bytes do not match its length")
        );
    }
    Ok(())
}

/// Scans the Extended Content Description for `WM/VideoClosedCaptioning`.
fn parse_extended_content_description(
    buf: &[u8],
    pos: usize,
    end: usize,
    header: &mut AsfHeader,
) -> Result<(), Error> {
    let get = |range: std::ops::Range<usize>| -> Result<&[u8], Error> {
        buf.get(range)
            .ok_or_else(|| err!(DataLoss, msg("truncated Extended Content Description")))
    };
    let count = LittleEndian::read_u16(get(pos + 24..pos + 26)?);
    let mut p = pos + 26;
    for _ in 0..count {
        if p >= end {
            bail!(DataLoss, msg("Extended Content Description overruns its object"));
        }
        let name_len = LittleEndian::read_u16(get(p..p + 2)?) as usize;
        let name = get(p + 2..p + 2 + name_len)?;
        let value_type = LittleEndian::read_u16(get(p + 2 + name_len..p + 4 + name_len)?);
        let value_len =
            LittleEndian::read_u16(get(p + 4 + name_len..p + 6 + name_len)?) as usize;
        let value = get(p + 6 + name_len..p + 6 + name_len + value_len)?;
        if utf16le_name_eq(name, "WM/VideoClosedCaptioning") {
            // This flag would be really useful if it were reliable. It isn't.
            if value_type == 2 || value_type == 3 {
                let flag = LittleEndian::read_i32(value.get(0..4).unwrap_or(&[0; 4]));
                header.video_closed_captioning_flag = Some(flag);
                debug!(
                    target: "ccdemux::parse",
                    "found WM/VideoClosedCaptioning flag: {flag}"
                );
            }
        }
        p += 6 + name_len + value_len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::MemSource;
    use crate::testutil;
    use byteorder::WriteBytesExt;

    /// Builds synthetic ASF files for the demuxer tests.
    struct AsfBuilder {
        header_objects: Vec<Vec<u8>>,
        packets: Vec<Vec<u8>>,
    }

    fn obj(guid: [u8; 16], body: &[u8]) -> Vec<u8> {
        let mut o = Vec::new();
        o.extend_from_slice(&guid);
        o.write_i64::<LittleEndian>(24 + body.len() as i64).unwrap();
        o.extend_from_slice(body);
        o
    }

    fn file_properties(min_packet: u32, max_packet: u32) -> Vec<u8> {
        let mut b = vec![0u8; 64]; // file id .. preroll (offsets 24..88)
        LittleEndian::write_i64(&mut b[16..24], 4096); // file size (offset 40)
        LittleEndian::write_i64(&mut b[32..40], 1); // packet count (offset 56)
        b.write_u32::<LittleEndian>(0x02).unwrap(); // flags: seekable (offset 88)
        b.write_u32::<LittleEndian>(min_packet).unwrap();
        b.write_u32::<LittleEndian>(max_packet).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap(); // max bitrate
        obj(ASF_FILE_PROPERTIES, &b)
    }

    fn stream_properties_body(media: [u8; 16], stream_number: u8, extra: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&media); // offset 24
        b.extend_from_slice(&[0u8; 16]); // EC type
        b.extend_from_slice(&[0u8; 8]); // time offset
        b.write_u32::<LittleEndian>(extra.len() as u32).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap(); // EC data length
        b.write_u16::<LittleEndian>(u16::from(stream_number)).unwrap(); // offset 72
        b.extend_from_slice(&[0u8; 4]); // reserved
        b.extend_from_slice(extra); // type-specific data (offset 78)
        b
    }

    fn stream_properties(media: [u8; 16], stream_number: u8) -> Vec<u8> {
        obj(ASF_STREAM_PROPERTIES, &stream_properties_body(media, stream_number, &[]))
    }

    /// Extended Stream Properties for a DVR-MS binary caption stream, with a
    /// dummy extension entry at 0 and the PTS extension at entry 1.
    fn extended_stream_properties(stream_number: u8, major: [u8; 16]) -> Vec<u8> {
        let mut b = vec![0u8; 44]; // start..max object size (offsets 24..68)
        b.write_u32::<LittleEndian>(0).unwrap(); // flags (offset 68)
        b.write_u16::<LittleEndian>(u16::from(stream_number)).unwrap(); // offset 72
        b.write_u16::<LittleEndian>(0).unwrap(); // language id
        b.extend_from_slice(&[0u8; 8]); // avg time per frame
        b.write_u16::<LittleEndian>(0).unwrap(); // name count (offset 84)
        b.write_u16::<LittleEndian>(2).unwrap(); // payload extension count
        // Entry 0: 2-byte extension.
        b.extend_from_slice(&[0x11u8; 16]);
        b.write_u16::<LittleEndian>(2).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap();
        // Entry 1: the DVR-MS PTS extension (24 bytes of data per payload).
        b.extend_from_slice(&DVRMS_PTS);
        b.write_u16::<LittleEndian>(24).unwrap();
        b.write_u32::<LittleEndian>(0).unwrap();
        // Inner Stream Properties declaring the binary media type.
        let inner = obj(
            ASF_STREAM_PROPERTIES,
            &stream_properties_body(ASF_BINARY_MEDIA, stream_number, &major),
        );
        b.extend_from_slice(&inner);
        obj(ASF_EXTENDED_STREAM_PROPERTIES, &b)
    }

    fn header_extension(sub_objects: &[Vec<u8>]) -> Vec<u8> {
        let mut data = Vec::new();
        for s in sub_objects {
            data.extend_from_slice(s);
        }
        let mut b = Vec::new();
        b.extend_from_slice(&[0u8; 16]); // reserved GUID
        b.write_u16::<LittleEndian>(6).unwrap(); // reserved
        b.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        b.extend_from_slice(&data);
        obj(ASF_HEADER_EXTENSION, &b)
    }

    impl AsfBuilder {
        fn new() -> Self {
            AsfBuilder {
                header_objects: Vec::new(),
                packets: Vec::new(),
            }
        }

        fn object(mut self, o: Vec<u8>) -> Self {
            self.header_objects.push(o);
            self
        }

        fn packet(mut self, p: Vec<u8>) -> Self {
            self.packets.push(p);
            self
        }

        fn build(self) -> Vec<u8> {
            let mut body = Vec::new();
            for o in &self.header_objects {
                body.extend_from_slice(o);
            }
            let mut out = Vec::new();
            out.extend_from_slice(&ASF_HEADER_GUID);
            out.write_i64::<LittleEndian>(30 + body.len() as i64).unwrap();
            out.write_u32::<LittleEndian>(self.header_objects.len() as u32)
                .unwrap();
            out.push(0x01);
            out.push(0x02);
            out.extend_from_slice(&body);

            let mut packets = Vec::new();
            for p in &self.packets {
                packets.extend_from_slice(p);
            }
            out.extend_from_slice(&ASF_DATA);
            out.write_i64::<LittleEndian>(50 + packets.len() as i64).unwrap();
            out.extend_from_slice(&[0u8; 16]); // file id
            out.write_u64::<LittleEndian>(self.packets.len() as u64).unwrap();
            out.write_u16::<LittleEndian>(0x0101).unwrap(); // reserved
            out.extend_from_slice(&packets);
            out
        }
    }

    /// Replicated data: media object size + presentation time, a 2-byte
    /// dummy extension, then the PTS extension payload.
    fn replicated(media_object_size: u32, presentation_ms: i32, rt_start: i64) -> Vec<u8> {
        let mut r = Vec::new();
        r.write_u32::<LittleEndian>(media_object_size).unwrap();
        r.write_i32::<LittleEndian>(presentation_ms).unwrap();
        r.extend_from_slice(&[0xAB, 0xCD]); // entry 0
        r.write_u32::<LittleEndian>(1).unwrap(); // dwVersion
        r.write_u32::<LittleEndian>(0).unwrap();
        r.write_i64::<LittleEndian>(rt_start).unwrap();
        r.write_i64::<LittleEndian>(rt_start + 333_666).unwrap();
        r
    }

    /// A single-payload packet: EC data, payload parsing info with word
    /// packet length and byte padding length, one payload.
    fn single_payload_packet(stream: u8, media_number: u8, rep: &[u8], data: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(0x82); // EC present, 2 bytes
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(0x48); // packet length word, padding byte, single payload
        p.push(0x15); // replicated/offset/media number: byte each
        let header_len = 3 + 2 + 9 + 4 + rep.len();
        let packet_length = (header_len + data.len()) as u16;
        p.write_u16::<LittleEndian>(packet_length).unwrap();
        p.push(0); // padding length
        p.write_u32::<LittleEndian>(0).unwrap(); // send time
        p.write_u16::<LittleEndian>(0).unwrap(); // duration
        p.push(stream | 0x80);
        p.push(media_number);
        p.push(0); // offset into media object
        p.push(rep.len() as u8);
        p.extend_from_slice(rep);
        p.extend_from_slice(data);
        p
    }

    /// One multi-payload packet whose payloads all belong to `stream`.
    fn multi_payload_packet(stream: u8, payloads: &[(u8, &[u8])]) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(0x82);
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(0x49); // multiple payloads, packet length word, padding byte
        p.push(0x15);
        let mut body = Vec::new();
        body.push(0x40 | payloads.len() as u8); // payload length type: byte
        for (media_number, data) in payloads {
            body.push(stream | 0x80);
            body.push(*media_number);
            body.push(0);
            let rep = replicated(data.len() as u32, 40 * i32::from(*media_number), 0);
            body.push(rep.len() as u8);
            body.extend_from_slice(&rep);
            body.push(data.len() as u8);
            body.extend_from_slice(data);
        }
        let packet_length = (3 + 2 + 9 + body.len()) as u16;
        p.write_u16::<LittleEndian>(packet_length).unwrap();
        p.push(0);
        p.write_u32::<LittleEndian>(0).unwrap();
        p.write_u16::<LittleEndian>(0).unwrap();
        p.extend_from_slice(&body);
        p
    }

    fn ntsc_file() -> Vec<u8> {
        AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .object(header_extension(&[extended_stream_properties(2, DVRMS_NTSC)]))
            .packet(single_payload_packet(
                2,
                0,
                &replicated(4, 100, 123_450_000),
                &[0x94, 0x20, 0x94, 0x20],
            ))
            .packet(single_payload_packet(
                2,
                1,
                &replicated(2, 133, 123_783_666),
                &[0x94, 0xAE],
            ))
            .build()
    }

    #[test]
    fn dvrms_ntsc_stream_selection() {
        testutil::init();
        let mut src = MemSource::new(ntsc_file());
        let demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        assert_eq!(demux.header.video_stream, 1);
        assert_eq!(demux.header.caption_stream, 2);
        assert_eq!(demux.header.caption_style, Some(CaptionStyle::Ntsc));
        assert_eq!(demux.header.decode_stream, 2);
        assert_eq!(demux.header.data_type, BufferDataType::Raw);
        assert_eq!(demux.header.total_data_packets, 2);
    }

    #[test]
    fn dvrms_pts_drives_block_timestamp() {
        testutil::init();
        let mut src = MemSource::new(ntsc_file());
        let mut timing = Timing::new(false);
        let mut demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        // The first media object completes when the second one begins; its
        // timestamp is the DVR-MS rt_start of its first payload.
        let payload = demux.get_more_data(&mut src, &mut timing).unwrap().unwrap();
        assert_eq!(payload.buf, vec![0x94, 0x20, 0x94, 0x20]);
        assert_eq!(payload.pts, Some(Mts(12_345 * TIME_UNITS_PER_MS)));
        assert_eq!(payload.data_type, BufferDataType::Raw);
        assert_eq!(payload.stream_id, 2);
        // Second call drains the final object.
        let payload = demux.get_more_data(&mut src, &mut timing).unwrap().unwrap();
        assert_eq!(payload.buf, vec![0x94, 0xAE]);
        assert!(demux.get_more_data(&mut src, &mut timing).unwrap().is_none());
    }

    #[test]
    fn multi_payload_media_boundary_resumes() {
        testutil::init();
        let file = AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .packet(multi_payload_packet(
                1,
                &[(7, &[0xAA, 0xAB]), (7, &[0xAC]), (8, &[0xB0, 0xB1])],
            ))
            .build();
        let mut src = MemSource::new(file);
        let mut timing = Timing::new(false);
        let mut demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        assert_eq!(demux.header.decode_stream, 1);
        assert_eq!(demux.header.data_type, BufferDataType::Pes);

        // Both payloads of media object 7 are returned together; the call
        // stops at the media-number change with the packet mid-flight.
        let payload = demux.get_more_data(&mut src, &mut timing).unwrap().unwrap();
        assert_eq!(payload.buf, vec![0xAA, 0xAB, 0xAC]);
        assert_eq!(demux.number_of_payloads, 3);
        assert_eq!(demux.payload_cur, 2);
        assert!(demux.resuming);

        // Re-entry picks up payload 3 without rereading its headers.
        let payload = demux.get_more_data(&mut src, &mut timing).unwrap().unwrap();
        assert_eq!(payload.buf, vec![0xB0, 0xB1]);
        assert!(demux.get_more_data(&mut src, &mut timing).unwrap().is_none());
        assert_eq!(demux.datapacket_cur, demux.header.total_data_packets);
    }

    #[test]
    fn atsc_without_fix_decodes_video_stream() {
        testutil::init();
        let file = AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .object(header_extension(&[extended_stream_properties(2, DVRMS_ATSC)]))
            .build();
        let mut src = MemSource::new(file);
        let demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        assert_eq!(demux.header.caption_style, Some(CaptionStyle::Atsc));
        assert_eq!(demux.header.decode_stream, 1);
        assert_eq!(demux.header.data_type, BufferDataType::Pes);

        // With the conversion fix, the caption stream itself is decoded.
        let mut src = MemSource::new(
            AsfBuilder::new()
                .object(file_properties(0, 0))
                .object(stream_properties(ASF_VIDEO_MEDIA, 1))
                .object(header_extension(&[extended_stream_properties(2, DVRMS_ATSC)]))
                .build(),
        );
        let opts = Options {
            wtv_convert_fix: true,
            ..Options::default()
        };
        let demux = AsfDemuxer::open(&mut src, &opts).unwrap().unwrap();
        assert_eq!(demux.header.decode_stream, 2);
        assert_eq!(demux.header.data_type, BufferDataType::Raw);
    }

    #[test]
    fn missing_header_guid_is_fatal() {
        testutil::init();
        let mut src = MemSource::new(vec![0u8; 64]);
        let e = AsfDemuxer::open(&mut src, &Options::default()).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::DataLoss);
    }

    #[test]
    fn missing_video_stream_is_fatal() {
        testutil::init();
        let file = AsfBuilder::new().object(file_properties(0, 0)).build();
        let mut src = MemSource::new(file);
        AsfDemuxer::open(&mut src, &Options::default()).unwrap_err();
    }

    #[test]
    fn truncated_header_reports_eof() {
        testutil::init();
        let mut file = ntsc_file();
        file.truncate(40);
        let mut src = MemSource::new(file);
        assert!(AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn guid_formatting() {
        assert_eq!(
            format_guid(&ASF_HEADER_GUID),
            "75B22630-668E-11CF-A6D9-00AA0062CE6C"
        );
    }

    #[test]
    fn utf16_name_compare() {
        let name: Vec<u8> = "WM/VideoClosedCaptioning\0"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert!(utf16le_name_eq(&name, "WM/VideoClosedCaptioning"));
        assert!(!utf16le_name_eq(&name[..10], "WM/VideoClosedCaptioning"));
    }

    #[test]
    fn error_correction_type_is_fatal() {
        testutil::init();
        let mut packet = single_payload_packet(1, 0, &replicated(1, 0, 0), &[0x00]);
        packet[0] = 0xE2; // reserved EC length type bits set
        let file = AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .packet(packet)
            .build();
        let mut src = MemSource::new(file);
        let mut timing = Timing::new(false);
        let mut demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        demux.get_more_data(&mut src, &mut timing).unwrap_err();
    }

    #[test]
    fn unknown_packet_length_is_fatal() {
        testutil::init();
        // Packet Length Type 0, a single payload, and no global packet size:
        // the payload length cannot be inferred.
        let mut p = Vec::new();
        p.push(0x82);
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(0x08); // packet length type 0, padding length type byte
        p.push(0x15);
        p.push(0); // padding length
        p.write_u32::<LittleEndian>(0).unwrap(); // send time
        p.write_u16::<LittleEndian>(0).unwrap(); // duration
        let file = AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .packet(p)
            .build();
        let mut src = MemSource::new(file);
        let mut timing = Timing::new(false);
        let mut demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        let e = demux.get_more_data(&mut src, &mut timing).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unimplemented);
    }

    #[test]
    fn compressed_payload_is_fatal() {
        testutil::init();
        // replicated_length == 1 marks compressed payload data.
        let mut p = Vec::new();
        p.push(0x82);
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(0x48);
        p.push(0x15);
        p.write_u16::<LittleEndian>(30).unwrap();
        p.push(0);
        p.write_u32::<LittleEndian>(0).unwrap();
        p.write_u16::<LittleEndian>(0).unwrap();
        p.push(0x81);
        p.push(0);
        p.push(0);
        p.push(1); // replicated length 1: compressed
        let file = AsfBuilder::new()
            .object(file_properties(0, 0))
            .object(stream_properties(ASF_VIDEO_MEDIA, 1))
            .packet(p)
            .build();
        let mut src = MemSource::new(file);
        let mut timing = Timing::new(false);
        let mut demux = AsfDemuxer::open(&mut src, &Options::default())
            .unwrap()
            .unwrap();
        let e = demux.get_more_data(&mut src, &mut timing).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unimplemented);
    }
}

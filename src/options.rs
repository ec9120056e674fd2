// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The options record consulted throughout the demux/decode call chain.
//! Populated from command-line flags by `cmds::extract`.

use base::time::MsTime;

/// Which output serializer the sink writes. The full SRT/SCC/MCC encoders are
/// external collaborators; these cover the raw interchange forms.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WriteFormat {
    /// Binary caption dump (timestamped cc tuples).
    #[default]
    Binary,
    /// Human-readable timestamped hex dump.
    Text,
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Treat DVR-MS ATSC caption streams like NTSC ones. Works around a bug
    /// in WTV→DVR-MS converters.
    pub wtv_convert_fix: bool,

    /// Reconstruct per-frame times from the GOP counter instead of PTS.
    pub use_gop_as_pts: bool,

    /// Order B-frames by picture order count instead of PTS.
    pub use_pic_order: bool,

    /// Disable the PTS discontinuity check entirely.
    pub ignore_pts_jumps: bool,

    /// MP4 chapters mode: dump chapter marks instead of captions.
    pub extract_chapters: bool,

    pub write_format: WriteFormat,

    /// Assume drop-frame timing when generating SMPTE timecodes. Only
    /// meaningful to downstream MCC-style encoders; recorded and passed on.
    pub force_dropframe: bool,

    /// Prefer the video track of an MP4 even when caption tracks exist.
    pub mp4_video_track: bool,

    /// Emit only blocks at or after this frame timestamp.
    pub start_at: Option<MsTime>,

    /// Stop emitting blocks after this frame timestamp.
    pub end_at: Option<MsTime>,
}

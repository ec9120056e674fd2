// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! PTS/FTS bookkeeping shared by the demuxers and the video parsers.
//!
//! Containers and slice headers publish a presentation timestamp through
//! [`Timing::set_current_pts`]; [`Timing::set_fts`] turns that into the
//! frame timestamp (ms since the start of the stream) that accompanies every
//! caption block handed to the sink. The temporal reference (`current_tref`)
//! is zero on anchor frames, which is when the sync point may move and PTS
//! discontinuities are detected.

use base::time::{MsTime, Mts};
use tracing::debug;

/// Going backwards by more than this at an anchor is a PTS discontinuity.
const JUMP_BACKWARD_MS: i64 = 200;

/// Jumping forward by at least this at an anchor is a PTS discontinuity.
const JUMP_FORWARD_MS: i64 = 5_000;

const DEFAULT_FPS: f64 = 30000.0 / 1001.0;

pub struct Timing {
    pts_received: bool,
    /// Smallest and largest PTS seen, for the end-of-file report.
    min_pts: Mts,
    max_pts: Mts,
    pub current_pts: Mts,

    /// PTS of the frame that maps to `fts_offset_ms`; rebased on jumps.
    base_pts: Mts,
    base_set: bool,
    /// PTS of the last anchor (tref == 0) frame, for jump detection.
    sync_pts: Mts,
    sync_set: bool,

    fts_offset_ms: i64,
    fts_now_ms: i64,
    fts_max_ms: i64,

    pub current_tref: i32,
    pub fps: f64,
    /// Frame rate declared by the container or MPEG-2 sequence header, which
    /// wins over VUI-derived rates for interlaced content.
    pub nominal_fps: Option<f64>,

    /// Set while caption and video streams legitimately diverge (ASF caption
    /// gaps) or permanently by the ignore-PTS-jumps option.
    pub disable_sync_check: bool,

    pts_jumps: u64,
}

impl Timing {
    pub fn new(ignore_pts_jumps: bool) -> Self {
        Timing {
            pts_received: false,
            min_pts: Mts::MAX,
            max_pts: Mts::MIN,
            current_pts: Mts(0),
            base_pts: Mts(0),
            base_set: false,
            sync_pts: Mts(0),
            sync_set: false,
            fts_offset_ms: 0,
            fts_now_ms: 0,
            fts_max_ms: 0,
            current_tref: 0,
            fps: DEFAULT_FPS,
            nominal_fps: None,
            disable_sync_check: ignore_pts_jumps,
            pts_jumps: 0,
        }
    }

    pub fn set_current_pts(&mut self, pts: Mts) {
        self.current_pts = pts;
        self.pts_received = true;
        if pts < self.min_pts {
            self.min_pts = pts;
        }
        if pts > self.max_pts {
            self.max_pts = pts;
        }
    }

    /// Approximate duration of one frame in ms at the current rate.
    pub fn frame_ms(&self) -> i64 {
        if self.fps > 0.0 {
            (1000.0 / self.fps) as i64
        } else {
            (1000.0 / DEFAULT_FPS) as i64
        }
    }

    /// Derives `fts_now` from the current PTS and temporal reference.
    ///
    /// The first anchor establishes the zero point. Later anchors move the
    /// sync point; a discontinuity (backwards, or a jump of several seconds)
    /// rebases the zero point so the emitted timeline stays monotonic, unless
    /// sync checking is disabled.
    pub fn set_fts(&mut self) {
        if !self.pts_received {
            return;
        }
        if !self.base_set {
            let tref_ticks = self.current_tref as i64 * self.frame_ms() * 90;
            self.base_pts = Mts(self.current_pts.0 - tref_ticks);
            self.base_set = true;
        }
        if self.current_tref == 0 {
            if self.sync_set && !self.disable_sync_check {
                let dif_ms = (self.current_pts - self.sync_pts).as_millis();
                if dif_ms < -JUMP_BACKWARD_MS || dif_ms >= JUMP_FORWARD_MS {
                    debug!(
                        target: "ccdemux::time",
                        "PTS jump of {dif_ms} ms at {}, rebasing timeline",
                        self.current_pts
                    );
                    self.pts_jumps += 1;
                    self.fts_offset_ms = self.fts_max_ms + self.frame_ms();
                    self.base_pts = self.current_pts;
                }
            }
            self.sync_pts = self.current_pts;
            self.sync_set = true;
        }
        self.fts_now_ms = self.fts_offset_ms + (self.current_pts - self.base_pts).as_millis();
        if self.fts_now_ms > self.fts_max_ms {
            self.fts_max_ms = self.fts_now_ms;
        }
    }

    pub fn fts_now(&self) -> MsTime {
        MsTime(self.fts_now_ms)
    }

    pub fn fts_max(&self) -> MsTime {
        MsTime(self.fts_max_ms)
    }

    pub fn min_pts(&self) -> Option<Mts> {
        self.pts_received.then_some(self.min_pts)
    }

    pub fn max_pts(&self) -> Option<Mts> {
        self.pts_received.then_some(self.max_pts)
    }

    pub fn pts_jumps(&self) -> u64 {
        self.pts_jumps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_is_relative_to_first_anchor() {
        let mut t = Timing::new(false);
        t.set_current_pts(Mts::from_millis(10_000));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(0));
        t.set_current_pts(Mts::from_millis(10_033));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(33));
    }

    #[test]
    fn no_fts_before_any_pts() {
        let mut t = Timing::new(false);
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(0));
        assert_eq!(t.min_pts(), None);
    }

    #[test]
    fn forward_jump_rebases() {
        let mut t = Timing::new(false);
        t.fps = 25.0;
        t.set_current_pts(Mts::from_millis(1_000));
        t.set_fts();
        t.set_current_pts(Mts::from_millis(1_100));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(100));
        // A ten-second jump continues the timeline one frame after the
        // furthest point instead of leaping.
        t.set_current_pts(Mts::from_millis(11_100));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(140));
        assert_eq!(t.pts_jumps(), 1);
    }

    #[test]
    fn backward_jump_rebases() {
        let mut t = Timing::new(false);
        t.fps = 25.0;
        t.set_current_pts(Mts::from_millis(5_000));
        t.set_fts();
        t.set_current_pts(Mts::from_millis(2_000));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(40));
        assert_eq!(t.pts_jumps(), 1);
    }

    #[test]
    fn disabled_sync_check_keeps_raw_deltas() {
        let mut t = Timing::new(true);
        t.set_current_pts(Mts::from_millis(1_000));
        t.set_fts();
        t.set_current_pts(Mts::from_millis(61_000));
        t.set_fts();
        assert_eq!(t.fts_now(), MsTime(60_000));
        assert_eq!(t.pts_jumps(), 0);
    }

    #[test]
    fn min_max_pts_tracked() {
        let mut t = Timing::new(false);
        t.set_current_pts(Mts::from_millis(500));
        t.set_current_pts(Mts::from_millis(100));
        t.set_current_pts(Mts::from_millis(900));
        assert_eq!(t.min_pts(), Some(Mts::from_millis(100)));
        assert_eq!(t.max_pts(), Some(Mts::from_millis(900)));
    }
}

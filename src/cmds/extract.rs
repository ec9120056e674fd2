// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to demultiplex a file and write its timed caption blocks.

use crate::avc::process_avc_stream;
use crate::caption::{BinaryDumpWriter, BufferDataType, CaptionSink, TextDumpWriter};
use crate::demux::{asf::AsfDemuxer, mp4, strip_pes_header, FileSource, Pipeline, StreamMode};
use crate::options::{Options, WriteFormat};
use crate::sequencer::StorePolicy;
use base::shutdown;
use base::time::MsTime;
use base::{bail, Error};
use bpaf::Bpaf;
use nix::sys::signal::{self, SigHandler, Signal};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Extracts closed captions from a video file.
#[derive(Bpaf, Debug)]
#[bpaf(command("extract"))]
pub struct Args {
    /// Write output here instead of stdout.
    #[bpaf(long, short, argument("PATH"))]
    output: Option<PathBuf>,

    /// Output form: `binary` (timestamped cc tuple dump) or `text`.
    #[bpaf(long, argument::<String>("FORMAT"), parse(parse_write_format), fallback(WriteFormat::Binary))]
    format: WriteFormat,

    /// Skip detection and treat the input as this container format.
    #[bpaf(long, argument::<String>("MODE"), parse(|s: String| super::parse_stream_mode(&s)), optional)]
    input_format: Option<StreamMode>,

    /// Treat DVR-MS ATSC caption streams like NTSC ones; works around a bug
    /// in WTV conversion tools.
    #[bpaf(long)]
    wtv_convert_fix: bool,

    /// Reconstruct per-frame times from the GOP counter instead of PTS.
    #[bpaf(long)]
    use_gop_as_pts: bool,

    /// Order B-frames by picture order count instead of PTS.
    #[bpaf(long)]
    use_pic_order: bool,

    /// Disable the PTS discontinuity check.
    #[bpaf(long)]
    ignore_pts_jumps: bool,

    /// Dump MP4 chapter marks instead of captions.
    #[bpaf(long)]
    extract_chapters: bool,

    /// Assume drop-frame timing when downstream encoders generate SMPTE
    /// timecodes.
    #[bpaf(long)]
    force_dropframe: bool,

    /// Prefer the video track of an MP4 even when caption tracks exist.
    #[bpaf(long)]
    mp4_video_track: bool,

    /// Emit only blocks at or after this time (`[HH:]MM:SS[.mmm]` or seconds).
    #[bpaf(long, argument::<String>("TIME"), parse(|s: String| MsTime::parse(&s)), optional)]
    start_at: Option<MsTime>,

    /// Stop emitting blocks after this time.
    #[bpaf(long, argument::<String>("TIME"), parse(|s: String| MsTime::parse(&s)), optional)]
    end_at: Option<MsTime>,

    /// Input container or elementary stream.
    #[bpaf(positional("FILE"))]
    input: PathBuf,
}

fn parse_write_format(s: String) -> Result<WriteFormat, String> {
    match s.as_str() {
        "binary" => Ok(WriteFormat::Binary),
        "text" => Ok(WriteFormat::Text),
        _ => Err(format!("unknown output format {s:?}; expected binary or text")),
    }
}

/// Bounds emission to the requested time window and counts what passed.
struct WindowSink<'a> {
    inner: &'a mut dyn CaptionSink,
    start: Option<MsTime>,
    end: Option<MsTime>,
    blocks: u64,
    suppressed: u64,
}

impl<'a> WindowSink<'a> {
    fn new(inner: &'a mut dyn CaptionSink, opts: &Options) -> Self {
        WindowSink {
            inner,
            start: opts.start_at,
            end: opts.end_at,
            blocks: 0,
            suppressed: 0,
        }
    }

    fn in_window(&self, t: MsTime) -> bool {
        if let Some(start) = self.start {
            if t < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if t > end {
                return false;
            }
        }
        true
    }
}

impl CaptionSink for WindowSink<'_> {
    fn cc_data(
        &mut self,
        fts: MsTime,
        data_type: BufferDataType,
        data: &[u8],
    ) -> Result<(), Error> {
        if !self.in_window(fts) {
            self.suppressed += 1;
            return Ok(());
        }
        self.blocks += 1;
        self.inner.cc_data(fts, data_type, data)
    }

    fn text_subtitle(
        &mut self,
        start: MsTime,
        end: Option<MsTime>,
        text: &str,
    ) -> Result<(), Error> {
        if !self.in_window(start) {
            self.suppressed += 1;
            return Ok(());
        }
        self.blocks += 1;
        self.inner.text_subtitle(start, end, text)
    }

    fn reset_block_counters(&mut self) {
        self.inner.reset_block_counters();
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()
    }
}

static SHUTDOWN_HANDLE: OnceLock<shutdown::Handle> = OnceLock::new();

extern "C" fn handle_termination(_signal: nix::libc::c_int) {
    // Only the atomic store is allowed here.
    if let Some(h) = SHUTDOWN_HANDLE.get() {
        h.request();
    }
}

fn install_signal_handlers(sender: &shutdown::Sender) -> Result<(), Error> {
    let _ = SHUTDOWN_HANDLE.set(sender.handle());
    let action = signal::SigAction::new(
        SigHandler::Handler(handle_termination),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)
            .map_err(|e| base::err!(Internal, msg("sigaction failed"), source(e)))?;
        signal::sigaction(Signal::SIGTERM, &action)
            .map_err(|e| base::err!(Internal, msg("sigaction failed"), source(e)))?;
    }
    Ok(())
}

pub fn run(args: Args) -> Result<i32, Error> {
    let opts = Options {
        wtv_convert_fix: args.wtv_convert_fix,
        use_gop_as_pts: args.use_gop_as_pts,
        use_pic_order: args.use_pic_order,
        ignore_pts_jumps: args.ignore_pts_jumps,
        extract_chapters: args.extract_chapters,
        write_format: args.format,
        force_dropframe: args.force_dropframe,
        mp4_video_track: args.mp4_video_track,
        start_at: args.start_at,
        end_at: args.end_at,
    };
    let mode = match args.input_format {
        Some(m) => m,
        None => super::detect_file(&args.input)?,
    };
    info!("{}: detected {mode}", args.input.display());
    if opts.force_dropframe {
        info!("drop-frame timecodes will be assumed by downstream encoders");
    }

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    install_signal_handlers(&shutdown_tx)?;

    let out: Box<dyn Write> = match &args.output {
        Some(p) => Box::new(std::io::BufWriter::new(std::fs::File::create(p)?)),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut sink: Box<dyn CaptionSink> = match opts.write_format {
        WriteFormat::Binary => Box::new(BinaryDumpWriter::new(out)),
        WriteFormat::Text => Box::new(TextDumpWriter::new(out)),
    };
    let mut sink = WindowSink::new(sink.as_mut(), &opts);

    match mode {
        StreamMode::Mp4 => extract_mp4(&args, &opts, &mut sink, &shutdown_rx)?,
        StreamMode::Asf => extract_asf(&args, &opts, &mut sink, &shutdown_rx)?,
        StreamMode::ElementaryStream => extract_es(&args, &opts, &mut sink)?,
        other => bail!(
            Unimplemented,
            msg("{other} input is handled by a sibling tool, not this one")
        ),
    }

    info!(
        "done: {} caption emissions written{}",
        sink.blocks,
        if sink.suppressed > 0 {
            format!(", {} outside the requested window", sink.suppressed)
        } else {
            String::new()
        }
    );
    drop(shutdown_tx);
    Ok(0)
}

fn extract_mp4(
    args: &Args,
    opts: &Options,
    sink: &mut WindowSink,
    shutdown_rx: &shutdown::Receiver,
) -> Result<(), Error> {
    let mut f = std::fs::File::open(&args.input)?;
    let mp4 = mp4::Mp4File::parse(&mut f)?;

    if opts.extract_chapters {
        if mp4.chapters.is_empty() {
            info!("no chapter information found");
            return Ok(());
        }
        let mut out = std::io::stdout().lock();
        return mp4::dump_chapters(&mp4.chapters, &mut out);
    }

    // MP4 samples append at a repeated display index instead of overwriting.
    let mut pl = Pipeline::new(opts, StorePolicy::Append);
    mp4::process_file(&mut f, &mp4, &mut pl, sink, shutdown_rx)?;
    pl.finish(sink, BufferDataType::H264)?;
    print_report(&pl);
    Ok(())
}

fn extract_asf(
    args: &Args,
    opts: &Options,
    sink: &mut WindowSink,
    shutdown_rx: &shutdown::Receiver,
) -> Result<(), Error> {
    let mut src = FileSource::open(&args.input)?;
    let Some(mut demux) = AsfDemuxer::open(&mut src, opts)? else {
        warn!("file ended before the ASF headers were complete; nothing to do");
        return Ok(());
    };
    let mut pl = Pipeline::new(opts, StorePolicy::Overwrite);
    let data_type = demux.header.data_type;
    loop {
        shutdown_rx.check()?;
        let Some(payload) = demux.get_more_data(&mut src, &mut pl.timing)? else {
            break;
        };
        tracing::trace!(
            target: "ccdemux::parse",
            "media object: stream #{} {} bytes",
            payload.stream_id,
            payload.buf.len()
        );
        if let Some(pts) = payload.pts {
            pl.timing.set_current_pts(pts);
        }
        pl.timing.set_fts();
        match payload.data_type {
            BufferDataType::Raw => {
                // DVR-MS NTSC caption streams carry bare 608 byte pairs.
                sink.cc_data(pl.timing.fts_now(), BufferDataType::Raw, &payload.buf)?;
            }
            _ => {
                // The video elementary stream, PES-wrapped per media object.
                let es = strip_pes_header(&payload.buf);
                let buf = es.unwrap_or(&payload.buf);
                pl.m2v.process(&mut pl.timing, &mut pl.seqr, sink, buf)?;
            }
        }
    }
    pl.finish(sink, data_type)?;
    print_report(&pl);
    Ok(())
}

fn extract_es(args: &Args, opts: &Options, sink: &mut WindowSink) -> Result<(), Error> {
    let mut buf = std::fs::read(&args.input)?;
    let mut pl = Pipeline::new(opts, StorePolicy::Overwrite);
    // MPEG-2 sequences open with a sequence header or GOP start code;
    // anything else is treated as AVC Annex B.
    let is_mpeg2 = buf
        .windows(4)
        .take(1)
        .any(|w| matches!(w, [0, 0, 1, 0xB3] | [0, 0, 1, 0xB8]));
    if is_mpeg2 {
        pl.m2v.process(&mut pl.timing, &mut pl.seqr, sink, &buf)?;
    } else {
        process_avc_stream(
            &mut pl.avc,
            &mut pl.timing,
            &mut pl.seqr,
            &pl.opts.clone(),
            sink,
            BufferDataType::Pes,
            &mut buf,
        )?;
    }
    pl.finish(sink, BufferDataType::Pes)?;
    print_report(&pl);
    Ok(())
}

/// The per-file statistics block printed at completion.
fn print_report(pl: &Pipeline) {
    let s = &pl.avc.stats;
    if s.num_nal_unit_type_7 > 0 || s.ccblocks_total > 0 {
        info!(
            "AVC: {} SPS NAL units, {} caption blocks received, {} lost, \
             {} frame-number jumps, {} HRD encounters, {} unexpected SEI lengths",
            s.num_nal_unit_type_7,
            s.ccblocks_total,
            s.ccblocks_lost,
            s.num_jump_in_frames,
            s.num_nal_hrd + s.num_vcl_hrd,
            s.num_unexpected_sei_length,
        );
    }
    let u = &pl.m2v.stats;
    if u.hdtv + u.dvd + u.scte20 + u.replaytv_4000 + u.replaytv_5000 + u.dish + u.divicom > 0 {
        info!(
            "user data: {} HDTV (GA94), {} DVD, {} SCTE-20, {} ReplayTV 4000, \
             {} ReplayTV 5000, {} Dish, {} Divicom; {} false picture headers, \
             {} pulldown frames",
            u.hdtv,
            u.dvd,
            u.scte20,
            u.replaytv_4000,
            u.replaytv_5000,
            u.dish,
            u.divicom,
            u.false_picture_headers,
            u.pulldown_frames,
        );
    }
    if let (Some(min), Some(max)) = (pl.timing.min_pts(), pl.timing.max_pts()) {
        info!(
            "PTS range: {min} .. {max}, {} jumps, last FTS {}",
            pl.timing.pts_jumps(),
            pl.timing.fts_max(),
        );
    }
    if let (Some(first), Some(last)) = (pl.m2v.first_gop_time, pl.m2v.last_gop_time) {
        info!("GOP time codes: {first} .. {last}");
    }
    if pl.seqr.blocks_dropped() > 0 {
        info!("{} caption tuples dropped on full buckets", pl.seqr.blocks_dropped());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_format_parsing() {
        assert_eq!(parse_write_format("binary".into()).unwrap(), WriteFormat::Binary);
        assert_eq!(parse_write_format("text".into()).unwrap(), WriteFormat::Text);
        parse_write_format("yaml".into()).unwrap_err();
    }

    #[test]
    fn window_bounds() {
        use crate::caption::testutil::RecordingSink;
        let opts = Options {
            start_at: Some(MsTime(1_000)),
            end_at: Some(MsTime(2_000)),
            ..Options::default()
        };
        let mut inner = RecordingSink::default();
        let mut w = WindowSink::new(&mut inner, &opts);
        w.cc_data(MsTime(500), BufferDataType::Raw, &[1, 2]).unwrap();
        w.cc_data(MsTime(1_500), BufferDataType::Raw, &[3, 4]).unwrap();
        w.cc_data(MsTime(2_500), BufferDataType::Raw, &[5, 6]).unwrap();
        assert_eq!(w.blocks, 1);
        assert_eq!(w.suppressed, 2);
        assert_eq!(inner.emissions.len(), 1);
        assert_eq!(inner.emissions[0].2, vec![3, 4]);
    }
}

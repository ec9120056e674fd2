// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to report a file's container structure and caption-relevant
//! streams without extracting anything.

use crate::demux::{asf::AsfDemuxer, mp4, FileSource, StreamMode};
use crate::options::Options;
use base::Error;
use bpaf::Bpaf;
use serde::Serialize;
use std::path::PathBuf;

/// Reports the container structure and caption streams of a file.
#[derive(Bpaf, Debug)]
#[bpaf(command("probe"))]
pub struct Args {
    /// Print the report as JSON instead of text.
    #[bpaf(long)]
    json: bool,

    /// File to inspect.
    #[bpaf(positional("FILE"))]
    input: PathBuf,
}

#[derive(Serialize)]
struct AsfReport {
    video_stream: u8,
    audio_stream: u8,
    caption_stream: u8,
    caption_style: Option<String>,
    decode_stream: u8,
    total_data_packets: u32,
    file_size: i64,
}

#[derive(Serialize)]
struct Mp4TrackReport {
    id: u32,
    handler: String,
    subtype: String,
    timescale: u32,
    samples: u32,
}

#[derive(Serialize)]
struct Mp4Report {
    tracks: Vec<Mp4TrackReport>,
    chapters: Vec<mp4::Chapter>,
}

#[derive(Serialize)]
struct Report {
    path: String,
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    asf: Option<AsfReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mp4: Option<Mp4Report>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mode = super::detect_file(&args.input)?;
    let mut report = Report {
        path: args.input.display().to_string(),
        mode: mode.to_string(),
        asf: None,
        mp4: None,
    };
    match mode {
        StreamMode::Asf => {
            let mut src = FileSource::open(&args.input)?;
            if let Some(demux) = AsfDemuxer::open(&mut src, &Options::default())? {
                let h = &demux.header;
                report.asf = Some(AsfReport {
                    video_stream: h.video_stream,
                    audio_stream: h.audio_stream,
                    caption_stream: h.caption_stream,
                    caption_style: h.caption_style.map(|s| format!("{s:?}")),
                    decode_stream: h.decode_stream,
                    total_data_packets: h.total_data_packets,
                    file_size: h.file_size,
                });
            }
        }
        StreamMode::Mp4 => {
            let mut f = std::fs::File::open(&args.input)?;
            let parsed = mp4::Mp4File::parse(&mut f)?;
            report.mp4 = Some(Mp4Report {
                tracks: parsed
                    .tracks
                    .iter()
                    .map(|t| Mp4TrackReport {
                        id: t.id,
                        handler: String::from_utf8_lossy(&t.handler).into_owned(),
                        subtype: String::from_utf8_lossy(&t.subtype).into_owned(),
                        timescale: t.timescale,
                        samples: t.sample_count(),
                    })
                    .collect(),
                chapters: parsed.chapters,
            });
        }
        _ => {}
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
        return Ok(0);
    }

    println!("{}: {}", report.path, report.mode);
    if let Some(a) = &report.asf {
        println!(
            "  video stream #{}  audio stream #{}  caption stream #{}{}",
            a.video_stream,
            a.audio_stream,
            a.caption_stream,
            a.caption_style
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default(),
        );
        println!(
            "  decode stream #{}  {} data packets  {} bytes",
            a.decode_stream, a.total_data_packets, a.file_size
        );
    }
    if let Some(m) = &report.mp4 {
        for t in &m.tracks {
            println!(
                "  track {}: {}:{} timescale {} samples {}",
                t.id, t.handler, t.subtype, t.timescale, t.samples
            );
        }
        for (i, c) in m.chapters.iter().enumerate() {
            println!("  chapter {}: {} {}", i + 1, c.time, c.name);
        }
    }
    Ok(0)
}

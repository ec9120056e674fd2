// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::demux::{detect_stream_mode, StreamMode};
use base::Error;
use std::io::Read;
use std::path::Path;

pub mod extract;
pub mod probe;

/// Bytes sniffed from the head of the input for format detection.
const DETECTION_BYTES: usize = 1024;

/// Probes the input's container format from its first bytes.
fn detect_file(path: &Path) -> Result<StreamMode, Error> {
    let mut f = std::fs::File::open(path)?;
    let mut header = vec![0u8; DETECTION_BYTES];
    let mut total = 0;
    while total < header.len() {
        let n = f.read(&mut header[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    header.truncate(total);
    Ok(detect_stream_mode(&header))
}

/// Parses a user-supplied input format override.
fn parse_stream_mode(s: &str) -> Result<StreamMode, String> {
    Ok(match s {
        "es" => StreamMode::ElementaryStream,
        "ts" => StreamMode::MpegTs,
        "ps" => StreamMode::MpegPs,
        "asf" | "dvr-ms" => StreamMode::Asf,
        "wtv" => StreamMode::Wtv,
        "gxf" => StreamMode::Gxf,
        "raw" => StreamMode::McpoodleRaw,
        "bin" => StreamMode::Rcwt,
        "mkv" => StreamMode::Matroska,
        "mp4" => StreamMode::Mp4,
        "myth" => StreamMode::Myth,
        _ => {
            return Err(format!(
                "unknown input format {s:?}; expected one of \
                 es/ts/ps/asf/wtv/gxf/raw/bin/mkv/mp4/myth"
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_mode_parsing() {
        assert_eq!(parse_stream_mode("mp4").unwrap(), StreamMode::Mp4);
        assert_eq!(parse_stream_mode("dvr-ms").unwrap(), StreamMode::Asf);
        parse_stream_mode("tarball").unwrap_err();
    }
}

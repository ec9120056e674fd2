// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind};
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod avc;
mod bitstream;
mod caption;
mod cmds;
mod demux;
mod hevc;
mod m2v;
mod nal;
mod options;
mod sequencer;
#[cfg(test)]
mod testutil;
mod timing;

/// ccdemux: closed caption demultiplexer and extractor.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    Extract(#[bpaf(external(cmds::extract::args))] cmds::extract::Args),
    Probe(#[bpaf(external(cmds::probe::args))] cmds::probe::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Extract(a) => cmds::extract::run(a),
            Args::Probe(a) => cmds::probe::run(a),
        }
    }
}

/// Maps the error classification to a process exit code, the only place
/// errors turn into numbers.
fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Cancelled => 130,
        ErrorKind::InvalidArgument | ErrorKind::NotFound => 2,
        ErrorKind::Unimplemented => 3,
        ErrorKind::DataLoss | ErrorKind::OutOfRange | ErrorKind::ResourceExhausted => 4,
        _ => 1,
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/ccdemux`: `ccdemux`), falling back to the crate name if
    // conversion to a path/UTF-8 string fails. `bpaf`'s default logic is
    // similar but doesn't have the fallback.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(exit_code(e.kind()));
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

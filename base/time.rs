// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time types for ccdemux's internal formats.
//!
//! Presentation timestamps throughout the pipeline are in 90 kHz MPEG system
//! clock units ([`Mts`]); the frame timestamps handed to caption sinks are in
//! milliseconds ([`MsTime`]).

use crate::{err, Error};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::str::FromStr;

type IResult<'a, I, O> = nom::IResult<I, O, nom::error::Error<&'a str>>;

/// The MPEG system clock frequency: timestamps tick 90,000 times per second.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// 90 kHz clock ticks per millisecond.
pub const TIME_UNITS_PER_MS: i64 = TIME_UNITS_PER_SEC / 1_000;

/// A presentation timestamp in 90 kHz MPEG system clock units.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Mts(pub i64);

impl Mts {
    pub const MIN: Self = Mts(i64::MIN);
    pub const MAX: Self = Mts(i64::MAX);

    pub fn from_millis(ms: i64) -> Self {
        Mts(ms * TIME_UNITS_PER_MS)
    }

    /// Truncates toward zero, as the original 90 kHz → ms conversions do.
    pub fn as_millis(self) -> i64 {
        self.0 / TIME_UNITS_PER_MS
    }
}

impl ops::Add for Mts {
    type Output = Mts;
    fn add(self, rhs: Mts) -> Mts {
        Mts(self.0 + rhs.0)
    }
}

impl ops::Sub for Mts {
    type Output = Mts;
    fn sub(self, rhs: Mts) -> Mts {
        Mts(self.0 - rhs.0)
    }
}

impl fmt::Display for Mts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, MsTime(self.as_millis()))
    }
}

/// A frame timestamp in milliseconds, displayed as `HH:MM:SS:mmm`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct MsTime(pub i64);

impl From<Mts> for MsTime {
    fn from(t: Mts) -> Self {
        MsTime(t.as_millis())
    }
}

impl fmt::Display for MsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ms = self.0;
        if ms < 0 {
            f.write_str("-")?;
            ms = -ms;
        }
        let h = ms / 3_600_000;
        let m = ms / 60_000 - h * 60;
        let s = ms / 1_000 - h * 3_600 - m * 60;
        let frac = ms % 1_000;
        write!(f, "{h:02}:{m:02}:{s:02}:{frac:03}")
    }
}

/// Returns a parser for a 1..=`max_len`-digit non-negative number which fits
/// into `T`.
fn num<'a, T: FromStr>(max_len: usize) -> impl FnMut(&'a str) -> IResult<'a, &'a str, T> {
    map_res(
        take_while_m_n(1, max_len, |c: char| c.is_ascii_digit()),
        |input: &str| input.parse(),
    )
}

/// Parses `[HH:]MM:SS[.mmm]` into milliseconds.
fn parse_clock(input: &str) -> IResult<&str, i64> {
    map(
        tuple((
            num::<i64>(2),
            preceded(tag(":"), num::<i64>(2)),
            opt(preceded(tag(":"), num::<i64>(2))),
            opt(preceded(tag("."), num::<i64>(3))),
        )),
        |(a, b, opt_c, opt_ms)| {
            let (h, m, s) = match opt_c {
                Some(c) => (a, b, c),
                None => (0, a, b),
            };
            (h * 3_600 + m * 60 + s) * 1_000 + opt_ms.unwrap_or(0)
        },
    )(input)
}

impl MsTime {
    /// Parses a time offset as either `[HH:]MM:SS[.mmm]` or a plain number of
    /// seconds. Used for `--start-at`/`--end-at`.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let (remaining, ms) = alt((parse_clock, map(num::<i64>(9), |s| s * 1_000)))(
            input,
        )
        .map_err(|e| err!(InvalidArgument, msg("unparseable time {input:?}: {e}")))?;
        if !remaining.is_empty() {
            return Err(err!(
                InvalidArgument,
                msg("unexpected suffix {remaining:?} on time {input:?}")
            ));
        }
        Ok(MsTime(ms))
    }
}

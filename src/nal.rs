// This file is part of ccdemux, a closed caption demultiplexer and extractor.
// Copyright (C) 2026 The ccdemux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! NAL unit framing shared by the AVC and HEVC paths: the ISO/IEC 14496-10
//! Annex B start-code scan and emulation-prevention removal.

use base::{bail, Error};

/// Removes `emulation_prevention_three_byte`s in place, turning an EBSP body
/// into its RBSP. Returns the RBSP length, or `None` when the body is broken:
/// a byte-aligned `0x000000`/`0x000001`/`0x000002`, or `0x000003` followed by
/// a byte above `0x03`.
///
/// A lone `0x03` as the final byte is the `cabac_zero_word` case; it is
/// dropped and the trailing zeros kept.
///
/// See "emulation_prevention_three_byte" notes in ISO/IEC 14496-10 section 7.4.
pub fn strip_emulation_prevention(nal: &mut [u8]) -> Option<usize> {
    let end = nal.len();
    let mut i = 0;
    let mut j = 0;
    let mut zeros = 0;
    while i < end {
        if zeros == 2 && nal[i] < 0x03 {
            return None;
        }
        if zeros == 2 && nal[i] == 0x03 {
            if i + 1 < end && nal[i + 1] > 0x03 {
                return None;
            }
            if i == end - 1 {
                return Some(j);
            }
            i += 1;
            zeros = 0;
        }
        nal[j] = nal[i];
        if nal[i] == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        i += 1;
        j += 1;
    }
    Some(j)
}

/// Walks the NAL units of an Annex B byte stream, calling `f` with each unit
/// (header byte included, emulation prevention still present). The slice is
/// mutable so `f` can strip emulation prevention in place.
///
/// The buffer must start with a start code (leading zeros allowed); a nonzero
/// byte before the first `0x01`, or a set forbidden_zero_bit, is a broken
/// stream. Start-code bytes plus the unit lengths account for every input
/// byte.
pub fn each_nal_unit<F>(buf: &mut [u8], mut f: F) -> Result<(), Error>
where
    F: FnMut(&mut [u8]) -> Result<(), Error>,
{
    let len = buf.len();
    // A NAL unit needs at least a start code plus a couple of bytes.
    if len <= 5 {
        bail!(DataLoss, msg("video stream buffer too short for a NAL unit"));
    }
    if buf[0] != 0x00 || buf[1] != 0x00 {
        bail!(DataLoss, msg("broken video stream: leading bytes are non-zero"));
    }

    let mut pos = 2;
    let mut first = true;
    while pos + 2 < len {
        // Find the 0x01 ending the next start code.
        while pos < len && buf[pos] != 0x01 {
            if first && buf[pos] != 0x00 {
                bail!(DataLoss, msg("broken video stream: leading bytes are non-zero"));
            }
            pos += 1;
        }
        first = false;
        if pos >= len {
            break;
        }
        let nal_start = pos + 1;

        // Find the next start code or the end of the buffer.
        let mut search = nal_start;
        let nal_end;
        loop {
            if search + 2 >= len {
                nal_end = len;
                pos = len;
                break;
            }
            match memchr::memchr(0x00, &buf[search..len - 2]) {
                None => {
                    nal_end = len;
                    pos = len;
                    break;
                }
                Some(off) => {
                    let z = search + off;
                    if buf[z + 1] == 0x00 && (buf[z + 2] | 0x01) == 0x01 {
                        nal_end = z;
                        pos = z + 2; // after the two leading 0x00
                        break;
                    }
                    search = z + 1;
                }
            }
        }

        if nal_start >= nal_end {
            continue;
        }
        if buf[nal_start] & 0x80 != 0 {
            bail!(DataLoss, msg("broken video stream: forbidden_zero_bit not zero"));
        }
        f(&mut buf[nal_start..nal_end])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_is_identity_without_escapes() {
        let mut data = *b"\x67\x4d\x00\x1f\x9a\x66\x02\x80";
        let orig = data;
        assert_eq!(strip_emulation_prevention(&mut data), Some(orig.len()));
        assert_eq!(data, orig);
    }

    #[test]
    fn strip_removes_escape() {
        let mut data = [0x12, 0x00, 0x00, 0x03, 0x01, 0x34];
        let n = strip_emulation_prevention(&mut data).unwrap();
        assert_eq!(&data[..n], &[0x12, 0x00, 0x00, 0x01, 0x34]);
    }

    #[test]
    fn strip_rejects_bare_start_code() {
        // 0x000000 and 0x000001 must not appear byte-aligned in a NAL body.
        assert_eq!(strip_emulation_prevention(&mut [0x12, 0x00, 0x00, 0x00]), None);
        assert_eq!(strip_emulation_prevention(&mut [0x12, 0x00, 0x00, 0x01]), None);
    }

    #[test]
    fn strip_rejects_bad_escape() {
        assert_eq!(
            strip_emulation_prevention(&mut [0x00, 0x00, 0x03, 0x05, 0x00]),
            None
        );
    }

    #[test]
    fn strip_keeps_cabac_zero_word() {
        let mut data = [0x12, 0x00, 0x00, 0x03];
        let n = strip_emulation_prevention(&mut data).unwrap();
        assert_eq!(&data[..n], &[0x12, 0x00, 0x00]);
    }

    // A two-unit Annex B fragment: an SPS containing interior 0x0000 runs
    // that are not start codes, then a PPS behind a four-byte start code.
    #[rustfmt::skip]
    const ANNEX_B_TEST_INPUT: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    #[test]
    fn walk_finds_units() {
        let mut data = ANNEX_B_TEST_INPUT;
        let mut units = Vec::new();
        each_nal_unit(&mut data, |nal| {
            units.push(nal.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &ANNEX_B_TEST_INPUT[4..27]);
        assert_eq!(&units[1][..], &ANNEX_B_TEST_INPUT[31..]);
        // Start codes plus unit lengths account for every byte.
        let unit_bytes: usize = units.iter().map(|u| u.len()).sum();
        assert_eq!(unit_bytes + 4 + 4, ANNEX_B_TEST_INPUT.len());
    }

    #[test]
    fn walk_rejects_garbage_prefix() {
        let mut data = [0x00, 0x00, 0x42, 0x01, 0x67, 0x00, 0x00];
        each_nal_unit(&mut data, |_| Ok(())).unwrap_err();
    }

    #[test]
    fn walk_rejects_forbidden_bit() {
        let mut data = [0x00, 0x00, 0x01, 0xE7, 0x42, 0x00, 0x0a];
        each_nal_unit(&mut data, |_| Ok(())).unwrap_err();
    }
}

// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (Data runs)

use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::{NtfsError, Result};

/// One extent of a non-resident attribute. `lcn == None` is a sparse run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Run {
    pub lcn: Option<u64>,
    pub length: u64,
}

impl Run {
    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }
}

/// Decoded mapping pairs of one attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunList {
    pub runs: Vec<Run>,
    pub total_clusters: u64,
}

// High bits OR-ed into an offset of the given byte width to sign-extend it.
const SIGN_EXTEND: [u64; 9] = [
    0,
    0xffff_ffff_ffff_ff00,
    0xffff_ffff_ffff_0000,
    0xffff_ffff_ff00_0000,
    0xffff_ffff_0000_0000,
    0xffff_ff00_0000_0000,
    0xffff_0000_0000_0000,
    0xff00_0000_0000_0000,
    0,
];

fn read_le(raw: &[u8]) -> u64 {
    raw.iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Decode a run list starting at `raw[0]` and ending at the first zero
/// header byte (or at the end of the buffer on a record boundary).
pub fn decode_run_list(raw: &[u8]) -> Result<RunList> {
    let mut out = RunList::default();
    let mut pos = 0usize;
    let mut last_lcn: i64 = 0;

    while pos < raw.len() && raw[pos] != 0 {
        let hdr = raw[pos];
        pos += 1;
        let len_sz = (hdr & 0x0F) as usize;
        let ofs_sz = (hdr >> 4) as usize;

        if len_sz > 8 || ofs_sz > 8 {
            return Err(NtfsError::MalformedRunList(format!(
                "field width too large in header 0x{:02x} at byte {}",
                hdr,
                pos - 1
            )));
        }
        if pos + len_sz + ofs_sz > raw.len() {
            return Err(NtfsError::MalformedRunList(format!(
                "record at byte {} runs past the end of the buffer ({} bytes)",
                pos - 1,
                raw.len()
            )));
        }

        let length = read_le(&raw[pos..pos + len_sz]);
        pos += len_sz;

        let lcn = if ofs_sz == 0 {
            None
        } else {
            let mut ofs = read_le(&raw[pos..pos + ofs_sz]);
            let hi_bit = 1u64 << (8 * ofs_sz - 1);
            if ofs & hi_bit != 0 {
                ofs |= SIGN_EXTEND[ofs_sz];
            }
            let lcn = last_lcn
                .checked_add(ofs as i64)
                .filter(|l| *l >= 0)
                .ok_or_else(|| {
                    NtfsError::MalformedRunList(format!(
                        "offset {} from LCN {} leaves the volume",
                        ofs as i64, last_lcn
                    ))
                })?;
            last_lcn = lcn;
            Some(lcn as u64)
        };
        pos += ofs_sz;

        if lcn.is_some_and(|l| l.checked_add(length).is_none()) {
            return Err(NtfsError::MalformedRunList(format!(
                "run of {} clusters at LCN {:?} overflows the cluster space",
                length, lcn
            )));
        }
        trace!("run: lcn={:?} length={}", lcn, length);
        out.total_clusters = out.total_clusters.checked_add(length).ok_or_else(|| {
            NtfsError::MalformedRunList(format!("total length overflows after {} runs", out.runs.len()))
        })?;
        out.runs.push(Run { lcn, length });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::encode_runs;

    #[test]
    fn decodes_single_run() {
        // 16 clusters at LCN 100
        let list = decode_run_list(&[0x21, 0x10, 0x64, 0x00, 0x00]).unwrap();
        assert_eq!(
            list.runs,
            vec![Run {
                lcn: Some(100),
                length: 16
            }]
        );
        assert_eq!(list.total_clusters, 16);
    }

    #[test]
    fn offsets_are_relative_and_signed() {
        let raw = [
            0x22, 0x0A, 0x00, 0xE8, 0x03, // 10 clusters at 1000
            0x11, 0x05, 0x9C, // 5 clusters at -100
            0x00,
        ];
        let list = decode_run_list(&raw).unwrap();
        assert_eq!(list.runs[0].lcn, Some(1000));
        assert_eq!(list.runs[1].lcn, Some(900));
        assert_eq!(list.total_clusters, 15);
    }

    #[test]
    fn sparse_runs_do_not_move_the_base() {
        let raw = [
            0x11, 0x04, 0x20, // 4 at 32
            0x01, 0x08, // 8 sparse
            0x11, 0x02, 0x10, // 2 at 32 + 16
            0x00,
        ];
        let list = decode_run_list(&raw).unwrap();
        assert_eq!(list.runs[1], Run { lcn: None, length: 8 });
        assert_eq!(list.runs[2].lcn, Some(48));
        assert_eq!(list.total_clusters, 14);
    }

    #[test]
    fn sign_extends_every_width() {
        for width in 1..=7usize {
            // first run far out, second run jumps back by one cluster
            let base = 1u64 << (8 * width);
            let mut raw = vec![0x81, 0x01];
            raw.extend_from_slice(&base.to_le_bytes());
            raw.push(((width as u8) << 4) | 1);
            raw.push(0x01);
            raw.extend(std::iter::repeat_n(0xFF, width));
            raw.push(0);
            let list = decode_run_list(&raw).unwrap();
            assert_eq!(list.runs[1].lcn, Some(base - 1), "width {}", width);
        }
    }

    #[test]
    fn rejects_wide_fields_and_truncation() {
        assert!(matches!(
            decode_run_list(&[0x91, 0x01]),
            Err(NtfsError::MalformedRunList(_))
        ));
        assert!(matches!(
            decode_run_list(&[0x32, 0x10, 0x00, 0x01]),
            Err(NtfsError::MalformedRunList(_))
        ));
        assert!(matches!(
            decode_run_list(&[0x11, 0x01, 0x80, 0x00]),
            Err(NtfsError::MalformedRunList(_))
        ));
    }

    #[test]
    fn rejects_overflowing_lengths() {
        let mut raw = vec![0x08];
        raw.extend([0xFF; 8]);
        raw.push(0x08);
        raw.extend([0xFF; 8]);
        raw.push(0x00);
        assert!(matches!(decode_run_list(&raw), Err(NtfsError::MalformedRunList(_))));

        // a single huge run starting far out
        let mut raw = vec![0x78];
        raw.extend([0xFF; 8]);
        raw.extend([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        raw.push(0x00);
        assert!(matches!(decode_run_list(&raw), Err(NtfsError::MalformedRunList(_))));
    }

    #[test]
    fn agrees_with_the_test_encoder() {
        let runs = [
            Run { lcn: Some(70_000), length: 3 },
            Run { lcn: None, length: 300 },
            Run { lcn: Some(12), length: 1 },
            Run { lcn: Some(40), length: 2 },
        ];
        let list = decode_run_list(&encode_runs(&runs)).unwrap();
        assert_eq!(list.runs, runs);
        assert_eq!(list.total_clusters, 306);
    }
}

//! In-memory volume and builders for the on-disk structures used by the
//! unit tests.

use crate::error::{NtfsError, Result};
use crate::mft::MftEntry;
use crate::run_list::Run;
use crate::volume::{NtfsVersion, Volume};

pub const SECTOR_SIZE: usize = 512;
pub const RECORD_SIZE: usize = 1024;

const FILETIME_2020: u64 = 132_223_104_000_000_000;

/// Volume backed by a byte vector. Cluster data lives at the start of
/// `image`, the MFT at `mft_offset`.
#[derive(Debug, Clone)]
pub struct MemVolume {
    pub image: Vec<u8>,
    pub bytes_per_cluster: u64,
    pub mft_offset: u64,
    pub version: Option<NtfsVersion>,
    /// Number of `read_bytes` calls so far.
    pub reads: usize,
}

impl MemVolume {
    pub fn with_image(image: Vec<u8>, bytes_per_cluster: u64) -> Self {
        Self {
            image,
            bytes_per_cluster,
            mft_offset: 1 << 20,
            version: Some(NtfsVersion::V3_1),
            reads: 0,
        }
    }

    /// Store a finished FILE record as MFT record `n`.
    pub fn put_record(&mut self, n: u64, record: &[u8]) {
        let at = (self.mft_offset + n * RECORD_SIZE as u64) as usize;
        if self.image.len() < at + RECORD_SIZE {
            self.image.resize(at + RECORD_SIZE, 0);
        }
        self.image[at..at + record.len()].copy_from_slice(record);
    }
}

impl Volume for MemVolume {
    fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_cluster
    }

    fn bytes_per_sector(&self) -> u64 {
        SECTOR_SIZE as u64
    }

    fn bytes_per_file_record(&self) -> u64 {
        RECORD_SIZE as u64
    }

    fn version(&self) -> Option<NtfsVersion> {
        self.version
    }

    fn mft_record_to_byte_position(&self, record: u64) -> Result<u64> {
        Ok(self.mft_offset + record * RECORD_SIZE as u64)
    }

    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.reads += 1;
        let start = offset as usize;
        let end = start + len;
        if end > self.image.len() {
            return Err(NtfsError::truncated("image read", len, self.image.len().saturating_sub(start)));
        }
        Ok(self.image[start..end].to_vec())
    }

    fn mft_entry(&mut self, record: u64) -> Result<MftEntry> {
        MftEntry::load(self, record)
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn unsigned_width(v: u64) -> usize {
    (1..8).find(|n| v >> (8 * n) == 0).unwrap_or(8)
}

fn signed_width(v: i64) -> usize {
    (1..8)
        .find(|n| {
            let bits = 8 * n - 1;
            v >= -(1i64 << bits) && v < (1i64 << bits)
        })
        .unwrap_or(8)
}

/// Mapping pairs for absolute runs, terminated by a zero byte.
pub fn encode_runs(runs: &[Run]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_lcn = 0i64;
    for run in runs {
        let len_sz = unsigned_width(run.length);
        let (ofs_sz, delta) = match run.lcn {
            Some(lcn) => {
                let delta = lcn as i64 - last_lcn;
                last_lcn = lcn as i64;
                (signed_width(delta), delta)
            }
            None => (0, 0),
        };
        out.push(((ofs_sz as u8) << 4) | len_sz as u8);
        out.extend_from_slice(&run.length.to_le_bytes()[..len_sz]);
        out.extend_from_slice(&delta.to_le_bytes()[..ofs_sz]);
    }
    out.push(0);
    out
}

/// Resident attribute record. An empty `name` means unnamed.
pub fn resident_attr(type_code: u32, name: &str, id: u16, value: &[u8]) -> Vec<u8> {
    let name = utf16(name);
    let value_off = align8(0x18 + name.len());
    let len = align8(value_off + value.len());
    let mut out = vec![0u8; len];
    put_u32(&mut out, 0, type_code);
    put_u32(&mut out, 4, len as u32);
    out[8] = 0;
    out[9] = (name.len() / 2) as u8;
    put_u16(&mut out, 10, 0x18);
    put_u16(&mut out, 14, id);
    put_u32(&mut out, 16, value.len() as u32);
    put_u16(&mut out, 20, value_off as u16);
    out[0x18..0x18 + name.len()].copy_from_slice(&name);
    out[value_off..value_off + value.len()].copy_from_slice(value);
    out
}

/// Non-resident attribute record carrying the encoded `runs`.
pub fn non_resident_attr(
    type_code: u32,
    name: &str,
    id: u16,
    runs: &[u8],
    first_vcn: u64,
    last_vcn: u64,
    data_size: u64,
) -> Vec<u8> {
    let name = utf16(name);
    let runs_off = align8(0x40 + name.len());
    let len = align8(runs_off + runs.len());
    let mut out = vec![0u8; len];
    put_u32(&mut out, 0, type_code);
    put_u32(&mut out, 4, len as u32);
    out[8] = 1;
    out[9] = (name.len() / 2) as u8;
    put_u16(&mut out, 10, 0x40);
    put_u16(&mut out, 14, id);
    put_u64(&mut out, 16, first_vcn);
    put_u64(&mut out, 24, last_vcn);
    put_u16(&mut out, 32, runs_off as u16);
    put_u64(&mut out, 40, data_size);
    put_u64(&mut out, 48, data_size);
    put_u64(&mut out, 56, data_size);
    out[0x40..0x40 + name.len()].copy_from_slice(&name);
    out[runs_off..runs_off + runs.len()].copy_from_slice(runs);
    out
}

/// `$FILE_NAME` value with all four timestamps set to 2020-01-01.
pub fn file_name_value(parent: u64, name: &str, namespace: u8, data_size: u64, flags: u32) -> Vec<u8> {
    let name16 = utf16(name);
    let mut out = vec![0u8; 66 + name16.len()];
    put_u64(&mut out, 0, parent);
    for at in [8, 16, 24, 32] {
        put_u64(&mut out, at, FILETIME_2020);
    }
    put_u64(&mut out, 40, align8(data_size as usize) as u64);
    put_u64(&mut out, 48, data_size);
    put_u32(&mut out, 56, flags);
    out[64] = (name16.len() / 2) as u8;
    out[65] = namespace;
    out[66..].copy_from_slice(&name16);
    out
}

fn record(n: u32, flags: u16, base: u64, attrs: &[Vec<u8>]) -> Vec<u8> {
    const USA_OFFSET: usize = 0x30;
    const USA_COUNT: usize = RECORD_SIZE / SECTOR_SIZE + 1;
    const ATTRS_OFFSET: usize = 0x38;

    let mut out = vec![0u8; RECORD_SIZE];
    out[0..4].copy_from_slice(b"FILE");
    put_u16(&mut out, 4, USA_OFFSET as u16);
    put_u16(&mut out, 6, USA_COUNT as u16);
    put_u16(&mut out, 16, 1);
    put_u16(&mut out, 18, 1);
    put_u16(&mut out, 20, ATTRS_OFFSET as u16);
    put_u16(&mut out, 22, flags);
    put_u64(&mut out, 32, base);
    put_u16(&mut out, 40, attrs.len() as u16);
    put_u32(&mut out, 0x2C, n);

    let mut at = ATTRS_OFFSET;
    for attr in attrs {
        out[at..at + attr.len()].copy_from_slice(attr);
        at += attr.len();
    }
    put_u32(&mut out, at, 0xFFFF_FFFF);
    put_u32(&mut out, 24, (at + 8) as u32);
    put_u32(&mut out, 28, RECORD_SIZE as u32);

    protect(&mut out, USA_OFFSET, USA_COUNT);
    out
}

// Move every sector tail into the update sequence array and stamp the
// update sequence number (1) in its place.
fn protect(buf: &mut [u8], usa_offset: usize, usa_count: usize) {
    put_u16(buf, usa_offset, 1);
    for i in 1..usa_count {
        let tail = i * SECTOR_SIZE - 2;
        let fix = usa_offset + 2 * i;
        buf[fix] = buf[tail];
        buf[fix + 1] = buf[tail + 1];
        put_u16(buf, tail, 1);
    }
}

/// Base FILE record `n` holding `attrs` in order.
pub fn file_record(n: u32, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
    record(n, flags, 0, attrs)
}

/// Extension record of `base`.
pub fn extension_record(n: u32, base: u64, attrs: &[Vec<u8>]) -> Vec<u8> {
    record(n, crate::mft::FILE_RECORD_IN_USE, base, attrs)
}

/// `$ATTRIBUTE_LIST` value from `(type, record, attribute id, start vcn)`.
pub fn attribute_list_value(entries: &[(u32, u64, u16, u64)]) -> Vec<u8> {
    const LEN: usize = 0x20;
    let mut out = Vec::new();
    for &(type_code, record, id, vcn) in entries {
        let mut e = vec![0u8; LEN];
        put_u32(&mut e, 0, type_code);
        put_u16(&mut e, 4, LEN as u16);
        e[7] = 0x1A;
        put_u64(&mut e, 8, vcn);
        put_u64(&mut e, 16, record);
        put_u16(&mut e, 24, id);
        out.extend(e);
    }
    out
}

/// Index entry wrapping an existing `$FILE_NAME` value.
pub fn index_entry_for(record: u64, file_name: &[u8], child: Option<u64>) -> Vec<u8> {
    let mut flags = 0u32;
    let mut len = align8(16 + file_name.len());
    if child.is_some() {
        flags |= crate::index::INDEX_ENTRY_HAS_CHILD;
        len += 8;
    }
    let mut out = vec![0u8; len];
    put_u64(&mut out, 0, record);
    put_u16(&mut out, 8, len as u16);
    put_u16(&mut out, 10, file_name.len() as u16);
    put_u32(&mut out, 12, flags);
    out[16..16 + file_name.len()].copy_from_slice(file_name);
    if let Some(vcn) = child {
        put_u64(&mut out, len - 8, vcn);
    }
    out
}

/// Index entry for `(record, name, namespace)`, or a content-less entry
/// when `file` is `None`. `last` marks the node's sentinel.
pub fn index_entry(file: Option<(u64, &str, u8)>, child: Option<u64>, last: bool) -> Vec<u8> {
    let mut out = match file {
        Some((record, name, ns)) => index_entry_for(record, &file_name_value(5, name, ns, 0, 0), child),
        None => index_entry_for(0, &[], child),
    };
    if last {
        let flags = u32::from_le_bytes([out[12], out[13], out[14], out[15]]) | crate::index::INDEX_ENTRY_LAST;
        put_u32(&mut out, 12, flags);
    }
    out
}

/// `$INDEX_ROOT` value of a `$FILE_NAME` index over `entries`.
pub fn index_root_value(entries: &[u8], has_children: bool, block_size: u32) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    put_u32(&mut out, 0, 0x30);
    put_u32(&mut out, 4, 1);
    put_u32(&mut out, 8, block_size);
    out[12] = 1;
    put_u32(&mut out, 16, 16);
    put_u32(&mut out, 20, 16 + entries.len() as u32);
    put_u32(&mut out, 24, 16 + entries.len() as u32);
    out[28] = u8::from(has_children);
    out.extend_from_slice(entries);
    out
}

/// A protected INDX block of `block_size` bytes for `vcn`.
pub fn index_block(vcn: u64, entries: &[u8], block_size: usize) -> Vec<u8> {
    const USA_OFFSET: usize = 0x28;
    const NODE: usize = 0x18;
    const ENTRIES: usize = 0x28;
    let usa_count = block_size / SECTOR_SIZE + 1;

    let mut out = vec![0u8; block_size];
    out[0..4].copy_from_slice(b"INDX");
    put_u16(&mut out, 4, USA_OFFSET as u16);
    put_u16(&mut out, 6, usa_count as u16);
    put_u64(&mut out, 16, vcn);
    let index_length = (ENTRIES + entries.len()) as u32;
    put_u32(&mut out, NODE, ENTRIES as u32);
    put_u32(&mut out, NODE + 4, index_length);
    put_u32(&mut out, NODE + 8, (block_size - NODE) as u32);
    let has_children = entries_have_children(entries);
    out[NODE + 12] = u8::from(has_children);
    out[NODE + ENTRIES..NODE + ENTRIES + entries.len()].copy_from_slice(entries);

    protect(&mut out, USA_OFFSET, usa_count);
    out
}

fn entries_have_children(entries: &[u8]) -> bool {
    let mut off = 0;
    while off + 16 <= entries.len() {
        let len = u16::from_le_bytes([entries[off + 8], entries[off + 9]]) as usize;
        let flags = u32::from_le_bytes([entries[off + 12], entries[off + 13], entries[off + 14], entries[off + 15]]);
        if flags & crate::index::INDEX_ENTRY_HAS_CHILD != 0 {
            return true;
        }
        if len == 0 {
            break;
        }
        off += len;
    }
    false
}

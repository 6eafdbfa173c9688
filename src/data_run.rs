use log::{debug, trace};
use std::io::SeekFrom;

use crate::cluster_cache::ClusterCache;
use crate::error::{NtfsError, Result};
use crate::run_list::{Run, decode_run_list};
use crate::volume::Volume;

/// Random-access reader over the clusters of a non-resident attribute.
///
/// Reads never go past the logical `length`, even when the run list maps
/// more clusters; a short or empty read at the end is authoritative.
#[derive(Debug, Clone)]
pub struct DataRun {
    runs: Vec<Run>,
    bytes_per_cluster: u64,
    length: u64,
    pos: u64,
    clusters: ClusterCache,
}

// Physical piece of a VCN range: `count` clusters at `lcn`, or zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    lcn: Option<u64>,
    count: u64,
}

impl DataRun {
    /// Decode `mapping_pairs` into a reader. `data_size == 0` derives the
    /// length from the total run length.
    pub fn new(mapping_pairs: &[u8], data_size: u64, bytes_per_cluster: u64) -> Result<Self> {
        let list = decode_run_list(mapping_pairs)?;
        let length = if data_size == 0 {
            list.total_clusters.checked_mul(bytes_per_cluster).ok_or_else(|| {
                NtfsError::MalformedRunList(format!("{} clusters overflow the byte length", list.total_clusters))
            })?
        } else {
            data_size
        };
        Ok(Self::from_runs(list.runs, length, bytes_per_cluster))
    }

    pub fn from_runs(runs: Vec<Run>, length: u64, bytes_per_cluster: u64) -> Self {
        Self {
            runs,
            bytes_per_cluster,
            length,
            pos: 0,
            clusters: ClusterCache::new(bytes_per_cluster as usize),
        }
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_cluster
    }

    /// Append the runs of the next piece of the same attribute (stored in an
    /// extension record). The caches stay separate.
    pub fn add_run(&mut self, other: &DataRun) {
        self.runs.extend_from_slice(&other.runs);
        self.length = self.length.saturating_add(other.length);
    }

    /// Shorten the logical length to at most `len`.
    pub fn truncate(&mut self, len: u64) {
        self.length = self.length.min(len);
        self.pos = self.pos.min(self.length);
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Move the cursor, clamped to `[0, length]`.
    pub fn seek(&mut self, to: SeekFrom) -> u64 {
        let target: i128 = match to {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(off) => self.pos as i128 + off as i128,
            SeekFrom::End(off) => self.length as i128 + off as i128,
        };
        self.pos = target.clamp(0, self.length as i128) as u64;
        self.pos
    }

    pub fn seek_to_vcn(&mut self, vcn: u64) -> u64 {
        self.seek(SeekFrom::Start(vcn.saturating_mul(self.bytes_per_cluster)))
    }

    /// Read up to `n` bytes from the cursor. Empty at end of stream.
    pub fn read(&mut self, vol: &mut dyn Volume, n: usize) -> Result<Vec<u8>> {
        if self.pos >= self.length || n == 0 {
            return Ok(Vec::new());
        }
        let n = (n as u64).min(self.length - self.pos);
        let bpc = self.bytes_per_cluster;
        let start_vcn = self.pos / bpc;
        let end_vcn = (self.pos + n - 1) / bpc;

        let data = self.get_clusters(vol, start_vcn, end_vcn)?;
        let from = (self.pos % bpc) as usize;
        let out = data[from..from + n as usize].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Read `len` bytes at `offset`, leaving the cursor after them.
    pub fn read_at(&mut self, vol: &mut dyn Volume, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset));
        self.read(vol, len)
    }

    /// The whole logical content.
    pub fn read_all(&mut self, vol: &mut dyn Volume) -> Result<Vec<u8>> {
        self.rewind();
        let len = usize::try_from(self.length)
            .map_err(|_| NtfsError::Malformed(format!("attribute length {} too large", self.length)))?;
        self.read(vol, len)
    }

    fn get_clusters(&mut self, vol: &mut dyn Volume, start_vcn: u64, end_vcn: u64) -> Result<Vec<u8>> {
        let num = end_vcn - start_vcn + 1;
        if let Some(hit) = self.clusters.get(start_vcn, num) {
            trace!("data run: VCN {}..={} served from cache", start_vcn, end_vcn);
            return Ok(hit);
        }

        let mut out = Vec::with_capacity((num * self.bytes_per_cluster) as usize);
        for (vcn, count, cached) in self.partition_cached(start_vcn, end_vcn) {
            let hit = if cached { self.clusters.get(vcn, count) } else { None };
            match hit {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => out.extend_from_slice(&self.read_raw_clusters(vol, vcn, count)?),
            }
        }

        self.clusters.put(start_vcn, out.clone());
        Ok(out)
    }

    // Maximal sub-ranges of [start, end] that are all cached or all uncached.
    fn partition_cached(&self, start_vcn: u64, end_vcn: u64) -> Vec<(u64, u64, bool)> {
        let mut parts: Vec<(u64, u64, bool)> = Vec::new();
        for vcn in start_vcn..=end_vcn {
            let cached = self.clusters.contains(vcn);
            match parts.last_mut() {
                Some((_, count, c)) if *c == cached => *count += 1,
                _ => parts.push((vcn, 1, cached)),
            }
        }
        parts
    }

    fn read_raw_clusters(&self, vol: &mut dyn Volume, vcn: u64, count: u64) -> Result<Vec<u8>> {
        let bpc = self.bytes_per_cluster;
        let mut out = Vec::with_capacity((count * bpc) as usize);
        for extent in self.extents(vcn, count) {
            let len = (extent.count * bpc) as usize;
            match extent.lcn {
                Some(lcn) => {
                    let abs = vol.logical_cluster_to_absolute_byte(lcn)?;
                    trace!("data run: device read {} clusters at LCN {} (byte {})", extent.count, lcn, abs);
                    let bytes = vol.read_bytes(abs, len)?;
                    if bytes.len() != len {
                        return Err(NtfsError::truncated("cluster read", len, bytes.len()));
                    }
                    out.extend_from_slice(&bytes);
                }
                None => out.resize(out.len() + len, 0),
            }
        }
        Ok(out)
    }

    // Physical extents backing `count` clusters from `start_vcn`, with
    // physically contiguous neighbours coalesced. Clusters past the end of
    // the run list read as zeros.
    fn extents(&self, start_vcn: u64, count: u64) -> Vec<Extent> {
        let mut out: Vec<Extent> = Vec::new();
        let mut push = |e: Extent| match out.last_mut() {
            Some(prev) if coalesces(prev, &e) => prev.count += e.count,
            _ => out.push(e),
        };

        let end_vcn = start_vcn.saturating_add(count);
        let mut vcn = start_vcn;
        let mut run_start = 0u64;
        for run in &self.runs {
            let run_end = run_start.saturating_add(run.length);
            if vcn < run_end && vcn >= run_start {
                let skip = vcn - run_start;
                let take = (run_end - vcn).min(end_vcn - vcn);
                push(Extent {
                    lcn: run.lcn.map(|l| l.saturating_add(skip)),
                    count: take,
                });
                vcn += take;
                if vcn >= end_vcn {
                    break;
                }
            }
            run_start = run_end;
        }
        if vcn < end_vcn {
            debug!("data run: VCN {}..{} beyond run list, zero-filled", vcn, end_vcn);
            push(Extent {
                lcn: None,
                count: end_vcn - vcn,
            });
        }
        out
    }
}

fn coalesces(prev: &Extent, next: &Extent) -> bool {
    match (prev.lcn, next.lcn) {
        (Some(p), Some(n)) => p.checked_add(prev.count) == Some(n),
        (None, None) => true,
        _ => false,
    }
}

// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf ($INDEX_ROOT)
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/index_record.html

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, SeekFrom};

use crate::data::{Bitmap, IndexAllocation};
use crate::error::{NtfsError, Result, require};
use crate::file_name::NS_DOS;
use crate::index::{DirectoryIndexNode, IndexNodeHeader, IndexRecordHeader};
use crate::mft::apply_fixups;
use crate::volume::Volume;

pub const COLLATION_FILE_NAME: u32 = 0x01;

/// Default bound on B+-tree descent.
pub const DEFAULT_MAX_DEPTH: usize = 32;

const ROOT_HEADER_LEN: usize = 16;

// Sector size the allocation VCNs count in when blocks are smaller than a
// cluster.
const SMALL_BLOCK_VCN_UNIT: u64 = 512;

enum Step {
    Found(DirectoryIndexNode),
    Descend(u64),
    Miss,
}

/// Resident root of a directory B+-tree, plus what it needs to reach the
/// overflow nodes (`$INDEX_ALLOCATION` gated by `$BITMAP`).
///
/// Lookups are lenient: a structured descent that misses falls back to a
/// full scan of the tree, and an overflow node that cannot be read (bit
/// unset, no covering allocation, bad signature or fixup, short read) counts
/// as an empty node instead of an error. Both results are memoised, so the
/// first call computes and later calls return the same value.
#[derive(Debug, Clone)]
pub struct IndexRoot {
    pub indexed_type: u32,
    pub collation_rule: u32,
    pub index_block_size: u32,
    pub clusters_per_index_block: u8,
    pub node_header: IndexNodeHeader,
    entries: Vec<DirectoryIndexNode>,
    bitmap: Option<Bitmap>,
    allocations: Vec<IndexAllocation>,
    max_depth: usize,
    overflow: HashMap<u64, Vec<DirectoryIndexNode>>,
    found: HashMap<String, DirectoryIndexNode>,
    globbed: Option<Vec<DirectoryIndexNode>>,
    globbed_by_name: bool,
    names: Option<Vec<String>>,
}

impl IndexRoot {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, ROOT_HEADER_LEN + IndexNodeHeader::SIZE, "$INDEX_ROOT")?;
        let mut cur = Cursor::new(raw);
        let indexed_type = cur.read_u32::<LittleEndian>()?;
        let collation_rule = cur.read_u32::<LittleEndian>()?;
        let index_block_size = cur.read_u32::<LittleEndian>()?;
        let clusters_per_index_block = cur.read_u8()?;

        let node = &raw[ROOT_HEADER_LEN..];
        let node_header = IndexNodeHeader::from_bytes(node)?;
        let entries = node_entries(node, &node_header)?;

        let mut root = Self {
            indexed_type,
            collation_rule,
            index_block_size,
            clusters_per_index_block,
            node_header,
            entries: Vec::new(),
            bitmap: None,
            allocations: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            overflow: HashMap::new(),
            found: HashMap::new(),
            globbed: None,
            globbed_by_name: false,
            names: None,
        };
        root.entries = root.clean(entries);
        Ok(root)
    }

    pub fn has_children(&self) -> bool {
        self.node_header.has_children()
    }

    /// Members of the resident node, sentinel included.
    pub fn entries(&self) -> &[DirectoryIndexNode] {
        &self.entries
    }

    pub fn set_bitmap(&mut self, bitmap: Option<Bitmap>) {
        if self.has_children() {
            self.bitmap = bitmap;
        }
    }

    pub fn set_allocations(&mut self, allocations: Vec<IndexAllocation>) {
        if self.has_children() {
            self.allocations = allocations;
        }
    }

    pub fn set_max_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Case-insensitive lookup of `name` in this directory.
    pub fn find(&mut self, vol: &mut dyn Volume, name: &str) -> Option<DirectoryIndexNode> {
        let key = name.to_lowercase();
        if let Some(hit) = self.found.get(&key) {
            return Some(hit.clone());
        }
        let found = match self.find_in_tree(vol, &key) {
            Some(e) => Some(e),
            None => {
                debug!("index: structured search missed {:?}, scanning whole index", key);
                self.find_backup(vol, &key)
            }
        };
        if let Some(e) = &found {
            self.found.insert(key, e.clone());
        }
        found
    }

    /// Answer from a flattened scan of every reachable node.
    pub fn find_backup(&mut self, vol: &mut dyn Volume, name: &str) -> Option<DirectoryIndexNode> {
        self.glob_entries_by_name(vol);
        self.found.get(&name.to_lowercase()).cloned()
    }

    /// Every entry name but DOS aliases, case-folded, in tree order.
    pub fn glob_names(&mut self, vol: &mut dyn Volume) -> &[String] {
        if self.names.is_none() {
            let names = self
                .glob_entries(vol)
                .iter()
                .filter(|e| e.namespace() != Some(NS_DOS))
                .filter_map(|e| e.name().map(str::to_lowercase))
                .collect();
            self.names = Some(names);
        }
        self.names.as_deref().unwrap_or(&[])
    }

    /// Every member entry of the tree (sentinels excluded), in tree order.
    pub fn glob_entries(&mut self, vol: &mut dyn Volume) -> &[DirectoryIndexNode] {
        if self.globbed.is_none() {
            self.prefetch_allocations(vol);
            let roots = self.entries.clone();
            let mut out = Vec::new();
            let mut visited = HashSet::new();
            self.glob_all_entries(vol, &roots, 0, &mut visited, &mut out);
            self.globbed = Some(out);
        }
        self.globbed.as_deref().unwrap_or(&[])
    }

    /// Members of the overflow node at `vcn`. Empty when the node cannot be
    /// read.
    pub fn index_alloc_entries(&mut self, vol: &mut dyn Volume, vcn: u64) -> &[DirectoryIndexNode] {
        if !self.overflow.contains_key(&vcn) {
            let entries = match self.load_block(vol, vcn) {
                Ok(Some(entries)) => self.clean(entries),
                Ok(None) => {
                    debug!("index: VCN {} not allocated", vcn);
                    Vec::new()
                }
                Err(e) => {
                    warn!("index: node at VCN {} unreadable, treated as empty: {}", vcn, e);
                    Vec::new()
                }
            };
            self.overflow.insert(vcn, entries);
        }
        self.overflow.get(&vcn).map(Vec::as_slice).unwrap_or(&[])
    }

    fn find_in_tree(&mut self, vol: &mut dyn Volume, name: &str) -> Option<DirectoryIndexNode> {
        let mut step = scan(&self.entries, name);
        let mut depth = 0;
        loop {
            match step {
                Step::Found(e) => return Some(e),
                Step::Miss => return None,
                Step::Descend(vcn) => {
                    depth += 1;
                    if depth > self.max_depth {
                        warn!("index: descent deeper than {} levels, giving up", self.max_depth);
                        return None;
                    }
                    step = scan(self.index_alloc_entries(vol, vcn), name);
                }
            }
        }
    }

    fn glob_entries_by_name(&mut self, vol: &mut dyn Volume) {
        if self.globbed_by_name {
            return;
        }
        let all = self.glob_entries(vol).to_vec();
        for e in all {
            if let Some(name) = e.name() {
                self.found.insert(name.to_lowercase(), e);
            }
        }
        self.globbed_by_name = true;
    }

    fn glob_all_entries(
        &mut self,
        vol: &mut dyn Volume,
        entries: &[DirectoryIndexNode],
        depth: usize,
        visited: &mut HashSet<u64>,
        out: &mut Vec<DirectoryIndexNode>,
    ) {
        for e in entries {
            if let Some(vcn) = e.child_vcn {
                if depth >= self.max_depth {
                    warn!("index: scan deeper than {} levels, VCN {} skipped", self.max_depth, vcn);
                } else if !visited.insert(vcn) {
                    warn!("index: VCN {} reached twice, skipped", vcn);
                } else {
                    let children = self.index_alloc_entries(vol, vcn).to_vec();
                    self.glob_all_entries(vol, &children, depth + 1, visited, out);
                }
            }
            if !e.is_last() {
                out.push(e.clone());
            }
        }
    }

    // Pull every allocation through its cluster cache in one read each.
    fn prefetch_allocations(&mut self, vol: &mut dyn Volume) {
        for alloc in &mut self.allocations {
            if let Err(e) = alloc.run.read_all(vol) {
                debug!("index: prefetch of VCN {}..={} failed: {}", alloc.first_vcn, alloc.last_vcn, e);
            }
        }
    }

    // Byte offset of the block `vcn` inside the allocation.
    fn block_byte_offset(&self, vcn: u64, bytes_per_cluster: u64) -> Result<u64> {
        let unit = if self.index_block_size as u64 >= bytes_per_cluster {
            bytes_per_cluster
        } else {
            SMALL_BLOCK_VCN_UNIT
        };
        vcn.checked_mul(unit)
            .ok_or_else(|| NtfsError::Malformed(format!("index child VCN {} is out of range", vcn)))
    }

    fn load_block(&mut self, vol: &mut dyn Volume, vcn: u64) -> Result<Option<Vec<DirectoryIndexNode>>> {
        let bpc = vol.bytes_per_cluster();
        let block_size = self.index_block_size as u64;
        if block_size == 0 {
            return Err(NtfsError::Malformed("index block size is 0".into()));
        }
        let byte_offset = self.block_byte_offset(vcn, bpc)?;

        let bit = byte_offset / block_size;
        match &self.bitmap {
            Some(bm) if bm.is_set(bit) => {}
            Some(bm) => {
                if bit >= bm.len_bits() {
                    debug!("index: VCN {} maps to bit {} past the {}-bit $BITMAP", vcn, bit, bm.len_bits());
                }
                return Ok(None);
            }
            None => return Err(NtfsError::NotFound("$BITMAP of $I30".into())),
        }

        let cluster = byte_offset / bpc;
        let alloc = self
            .allocations
            .iter_mut()
            .find(|a| a.contains_vcn(cluster))
            .ok_or_else(|| NtfsError::NotFound(format!("allocation covering VCN {}", vcn)))?;
        let rel = alloc
            .first_vcn
            .checked_mul(bpc)
            .and_then(|start| byte_offset.checked_sub(start))
            .ok_or_else(|| NtfsError::Malformed(format!("allocation at VCN {} is out of range", alloc.first_vcn)))?;
        alloc.run.seek(SeekFrom::Start(rel));
        let mut buf = alloc.run.read(vol, block_size as usize)?;
        if buf.len() < block_size as usize {
            return Err(NtfsError::truncated("index block", block_size as usize, buf.len()));
        }
        trace!("index: read block VCN {} at allocation offset {}", vcn, rel);

        let record = IndexRecordHeader::from_bytes(&buf)?;
        apply_fixups(
            &mut buf,
            vol.bytes_per_sector() as usize,
            record.usa_offset as usize,
            record.usa_count as usize,
        )?;
        let node = &buf[IndexRecordHeader::SIZE..];
        let header = IndexNodeHeader::from_bytes(node)?;
        Ok(Some(node_entries(node, &header)?))
    }

    // Keep members only, memoising them by name.
    fn clean(&mut self, entries: Vec<DirectoryIndexNode>) -> Vec<DirectoryIndexNode> {
        let kept: Vec<DirectoryIndexNode> = entries.into_iter().filter(DirectoryIndexNode::is_member).collect();
        for e in &kept {
            if let (false, Some(name)) = (e.is_last(), e.name()) {
                self.found.insert(name.to_lowercase(), e.clone());
            }
        }
        kept
    }
}

// Entry stream of a node whose header starts at `node[0]`.
fn node_entries(node: &[u8], header: &IndexNodeHeader) -> Result<Vec<DirectoryIndexNode>> {
    let start = header.entries_offset as usize;
    let end = (header.index_length as usize).min(node.len());
    if start >= end {
        return Err(NtfsError::Malformed(format!(
            "index node entries at {} past node end {}",
            start, end
        )));
    }
    DirectoryIndexNode::node_factory(&node[start..end])
}

// One level of the B+-tree search. `name` is already case-folded.
fn scan(entries: &[DirectoryIndexNode], name: &str) -> Step {
    for e in entries {
        let key = e.name().map(str::to_lowercase);
        if key.as_deref() == Some(name) {
            return Step::Found(e.clone());
        }
        let before = key.as_deref().is_none_or(|k| name < k);
        if e.is_last() || before {
            return match e.child_vcn {
                Some(vcn) => Step::Descend(vcn),
                None => Step::Miss,
            };
        }
    }
    Step::Miss
}

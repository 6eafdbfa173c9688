// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf ($INDEX_ROOT, $INDEX_ALLOCATION)

use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use serde::Serialize;
use std::io::Cursor;

use crate::error::{NtfsError, Result, require};
use crate::file_name::{FileName, FileReference};
use crate::mft::MftEntry;
use crate::volume::Volume;

pub const INDEX_ENTRY_HAS_CHILD: u32 = 0x0000_0001;
pub const INDEX_ENTRY_LAST: u32 = 0x0000_0002;

/// Node header flag: entries of this node have children in the allocation.
pub const INDEX_NODE_LARGE: u8 = 0x01;

/// Records below this number are the NTFS metadata files.
pub const FIRST_NON_METADATA_RECORD: u64 = 12;

const ENTRY_HEADER_LEN: usize = 16;

/// Header shared by the index root and every INDX block.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexNodeHeader {
    /// Relative to the start of this header.
    pub entries_offset: u32,
    pub index_length: u32,
    pub allocated_size: u32,
    pub flags: u8,
}

impl IndexNodeHeader {
    pub const SIZE: usize = 16;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, Self::SIZE, "index node header")?;
        let mut cur = Cursor::new(raw);
        Ok(Self {
            entries_offset: cur.read_u32::<LittleEndian>()?,
            index_length: cur.read_u32::<LittleEndian>()?,
            allocated_size: cur.read_u32::<LittleEndian>()?,
            flags: cur.read_u8()?,
        })
    }

    pub fn has_children(&self) -> bool {
        self.flags & INDEX_NODE_LARGE != 0
    }
}

/// Prologue of an INDX block; the node header follows at 0x18.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexRecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub vcn: u64,
}

impl IndexRecordHeader {
    pub const SIGNATURE: &'static [u8; 4] = b"INDX";
    pub const SIZE: usize = 0x18;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, Self::SIZE, "INDX header")?;
        if &raw[0..4] != Self::SIGNATURE {
            return Err(NtfsError::BadSignature {
                expected: "INDX",
                found: String::from_utf8_lossy(&raw[0..4]).into_owned(),
            });
        }
        let mut cur = Cursor::new(&raw[4..]);
        Ok(Self {
            usa_offset: cur.read_u16::<LittleEndian>()?,
            usa_count: cur.read_u16::<LittleEndian>()?,
            lsn: cur.read_u64::<LittleEndian>()?,
            vcn: cur.read_u64::<LittleEndian>()?,
        })
    }
}

/// One entry of a directory B+-tree node.
#[derive(Debug, Clone)]
pub struct DirectoryIndexNode {
    /// Soft back-reference: the sequence number is only compared on resolve.
    pub reference: FileReference,
    pub length: u16,
    pub content_length: u16,
    pub flags: u32,
    pub file_name: Option<FileName>,
    pub child_vcn: Option<u64>,
}

impl DirectoryIndexNode {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, ENTRY_HEADER_LEN, "index entry")?;
        let mut cur = Cursor::new(raw);
        let reference = FileReference::from(cur.read_u64::<LittleEndian>()?);
        let length = cur.read_u16::<LittleEndian>()?;
        let content_length = cur.read_u16::<LittleEndian>()?;
        let flags = cur.read_u32::<LittleEndian>()?;

        let len = length as usize;
        if len < ENTRY_HEADER_LEN {
            return Err(NtfsError::Malformed(format!("index entry length {}", length)));
        }
        require(raw, len, "index entry")?;

        let file_name = if content_length > 0 {
            let end = ENTRY_HEADER_LEN + content_length as usize;
            require(raw, end, "index entry $FILE_NAME")?;
            Some(FileName::from_bytes(&raw[ENTRY_HEADER_LEN..end])?)
        } else {
            None
        };

        let child_vcn = if flags & INDEX_ENTRY_HAS_CHILD != 0 {
            if len < ENTRY_HEADER_LEN + 8 {
                return Err(NtfsError::truncated("index entry child VCN", ENTRY_HEADER_LEN + 8, len));
            }
            let mut c = Cursor::new(&raw[len - 8..len]);
            Some(c.read_u64::<LittleEndian>()?)
        } else {
            None
        };

        Ok(Self {
            reference,
            length,
            content_length,
            flags,
            file_name,
            child_vcn,
        })
    }

    /// Decode the entry stream of a node until the last-entry sentinel.
    pub fn node_factory(raw: &[u8]) -> Result<Vec<Self>> {
        let mut nodes = Vec::new();
        let mut off = 0usize;
        loop {
            if off >= raw.len() {
                return Err(NtfsError::Malformed("index node without a last entry".into()));
            }
            let node = Self::from_bytes(&raw[off..])?;
            off += node.length as usize;
            let last = node.is_last();
            nodes.push(node);
            if last {
                return Ok(nodes);
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.file_name.as_ref().map(|f| f.name.as_str())
    }

    pub fn namespace(&self) -> Option<u8> {
        self.file_name.as_ref().map(|f| f.namespace)
    }

    pub fn has_child(&self) -> bool {
        self.flags & INDEX_ENTRY_HAS_CHILD != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & INDEX_ENTRY_LAST != 0
    }

    /// `$MFT`, `$Bitmap`, `.` of the root and friends.
    pub fn is_metadata_self_entry(&self) -> bool {
        self.reference.record < FIRST_NON_METADATA_RECORD
            && self.name().is_some_and(|n| n.starts_with('$'))
    }

    /// Entries kept in a node: the sentinel, and anything with content that
    /// is not a metadata self-entry.
    pub fn is_member(&self) -> bool {
        self.is_last() || (self.content_length > 0 && !self.is_metadata_self_entry())
    }

    /// Directory per the embedded `$FILE_NAME`. Entries without content are
    /// never directories.
    pub fn is_directory(&self) -> bool {
        self.file_name.as_ref().is_some_and(FileName::is_directory)
    }

    /// Load the MFT record this entry points to.
    pub fn resolve(&self, vol: &mut dyn Volume) -> Result<Option<MftEntry>> {
        if self.content_length == 0 {
            return Ok(None);
        }
        let entry = vol.mft_entry(self.reference.record)?;
        if self.reference.sequence != 0 && entry.sequence_number() != self.reference.sequence {
            warn!(
                "stale index reference to record {}: sequence {} in index, {} on disk",
                self.reference.record,
                self.reference.sequence,
                entry.sequence_number()
            );
        }
        Ok(Some(entry))
    }
}

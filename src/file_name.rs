use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Cursor;

use crate::attribute::{filetime_to_datetime, utf16le_to_string};
use crate::error::{Result, require};

pub const NS_POSIX: u8 = 0;
pub const NS_WIN32: u8 = 1;
pub const NS_DOS: u8 = 2;
pub const NS_WIN32_AND_DOS: u8 = 3;

/// `$FILE_NAME` flag set on directories.
pub const FILE_NAME_FLAG_DIRECTORY: u32 = 0x1000_0000;

const NAME_OFFSET: usize = 66;

/// MFT reference: 48-bit record number plus 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FileReference {
    pub record: u64,
    pub sequence: u16,
}

impl From<u64> for FileReference {
    fn from(raw: u64) -> Self {
        Self {
            record: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }
}

/// Parsed `$FILE_NAME` attribute. Also the key of every directory index entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileName {
    pub parent: FileReference,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub flags: u32,
    pub reparse: u32,
    pub namespace: u8,
    pub name: String,
}

impl FileName {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, NAME_OFFSET, "$FILE_NAME")?;
        let mut cur = Cursor::new(raw);
        let parent = FileReference::from(cur.read_u64::<LittleEndian>()?);
        let created = cur.read_u64::<LittleEndian>()?;
        let modified = cur.read_u64::<LittleEndian>()?;
        let mft_modified = cur.read_u64::<LittleEndian>()?;
        let accessed = cur.read_u64::<LittleEndian>()?;
        let allocated_size = cur.read_u64::<LittleEndian>()?;
        let data_size = cur.read_u64::<LittleEndian>()?;
        let flags = cur.read_u32::<LittleEndian>()?;
        let reparse = cur.read_u32::<LittleEndian>()?;
        let name_len = cur.read_u8()? as usize;
        let namespace = cur.read_u8()?;

        let end = NAME_OFFSET + name_len * 2;
        require(raw, end, "$FILE_NAME name")?;
        let name = utf16le_to_string(&raw[NAME_OFFSET..end]);

        Ok(Self {
            parent,
            created,
            modified,
            mft_modified,
            accessed,
            allocated_size,
            data_size,
            flags,
            reparse,
            namespace,
            name,
        })
    }

    /// DOS 8.3 alias of a long name.
    pub fn is_dos_alias(&self) -> bool {
        self.namespace == NS_DOS
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_NAME_FLAG_DIRECTORY != 0
    }

    pub fn length(&self) -> u64 {
        self.data_size
    }

    pub fn c_time(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.created)
    }

    pub fn m_time(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.modified)
    }

    pub fn a_time(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.accessed)
    }

    pub fn to_json(&self) -> Value {
        let rfc = |ft: u64| filetime_to_datetime(ft).map(|d| d.to_rfc3339());
        json!({
            "name": self.name,
            "namespace": self.namespace,
            "parent": self.parent.record,
            "parent_seq": self.parent.sequence,
            "allocated": self.allocated_size,
            "size": self.data_size,
            "created": rfc(self.created),
            "modified": rfc(self.modified),
            "mft_modified": rfc(self.mft_modified),
            "accessed": rfc(self.accessed),
            "flags": self.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::file_name_value;

    #[test]
    fn parses_name_sizes_and_parent() {
        let raw = file_name_value(5, "Foo.txt", NS_WIN32, 1234, 0);
        let fname = FileName::from_bytes(&raw).unwrap();
        assert_eq!(fname.name, "Foo.txt");
        assert_eq!(fname.parent, FileReference { record: 5, sequence: 0 });
        assert_eq!(fname.length(), 1234);
        assert!(!fname.is_directory());
        assert!(!fname.is_dos_alias());
        assert!(fname.m_time().is_some());
    }

    #[test]
    fn short_buffer_is_truncated() {
        let raw = file_name_value(5, "abc", NS_POSIX, 0, 0);
        assert!(FileName::from_bytes(&raw[..60]).is_err());
        assert!(FileName::from_bytes(&raw[..NAME_OFFSET + 2]).is_err());
    }

    #[test]
    fn splits_file_reference() {
        let r = FileReference::from(0x0003_0000_0000_002A);
        assert_eq!(r.record, 42);
        assert_eq!(r.sequence, 3);
    }
}

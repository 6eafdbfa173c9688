use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::attribute::{filetime_to_datetime, utf16le_to_string};
use crate::error::{Result, require};
use crate::volume::NtfsVersion;

/// Parsed $STANDARD_INFORMATION (covers v1.2 & v3.x layouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardInformation {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub file_attrs: u32,
    pub max_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
    pub quota_charged: Option<u64>,
    pub usn: Option<u64>,
}

impl StandardInformation {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, 0x30, "$STANDARD_INFORMATION")?;
        let mut cur = Cursor::new(raw);
        let created = cur.read_u64::<LittleEndian>()?;
        let modified = cur.read_u64::<LittleEndian>()?;
        let mft_modified = cur.read_u64::<LittleEndian>()?;
        let accessed = cur.read_u64::<LittleEndian>()?;
        let file_attrs = cur.read_u32::<LittleEndian>()?;
        let max_versions = cur.read_u32::<LittleEndian>()?;
        let version_number = cur.read_u32::<LittleEndian>()?;
        let class_id = cur.read_u32::<LittleEndian>()?;
        let owner_id = (raw.len() >= 0x34).then(|| cur.read_u32::<LittleEndian>()).transpose()?;
        let security_id = (raw.len() >= 0x38).then(|| cur.read_u32::<LittleEndian>()).transpose()?;
        let quota_charged = (raw.len() >= 0x40).then(|| cur.read_u64::<LittleEndian>()).transpose()?;
        let usn = (raw.len() >= 0x48).then(|| cur.read_u64::<LittleEndian>()).transpose()?;
        Ok(Self {
            created,
            modified,
            mft_modified,
            accessed,
            file_attrs,
            max_versions,
            version_number,
            class_id,
            owner_id,
            security_id,
            quota_charged,
            usn,
        })
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.created)
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.modified)
    }

    pub fn accessed_at(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.accessed)
    }
}

/// A 16-byte GUID as stored on disk (mixed-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9]
        )?;
        for x in &b[10..] {
            write!(f, "{:02X}", x)?;
        }
        Ok(())
    }
}

/// $OBJECT_ID. Only the object id is mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_id: Guid,
    pub birth_volume_id: Option<Guid>,
    pub birth_object_id: Option<Guid>,
    pub domain_id: Option<Guid>,
}

impl ObjectId {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, 16, "$OBJECT_ID")?;
        let guid = |i: usize| -> Option<Guid> {
            let chunk = raw.get(i * 16..(i + 1) * 16)?;
            let mut g = [0u8; 16];
            g.copy_from_slice(chunk);
            Some(Guid(g))
        };
        let object_id = guid(0).unwrap_or(Guid([0; 16]));
        let extended = raw.len() > 16;
        Ok(Self {
            object_id,
            birth_volume_id: guid(1).filter(|_| extended),
            birth_object_id: guid(2).filter(|_| extended),
            domain_id: guid(3).filter(|_| extended),
        })
    }
}

/// $VOLUME_NAME, only present in `$Volume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeName {
    pub name: String,
}

impl VolumeName {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            name: utf16le_to_string(raw),
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub const VOLUME_IS_DIRTY: u16 = 0x0001;

/// $VOLUME_INFORMATION, only present in `$Volume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInformation {
    pub major: u8,
    pub minor: u8,
    pub flags: u16,
}

impl VolumeInformation {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require(raw, 12, "$VOLUME_INFORMATION")?;
        let mut cur = Cursor::new(&raw[8..]);
        Ok(Self {
            major: cur.read_u8()?,
            minor: cur.read_u8()?,
            flags: cur.read_u16::<LittleEndian>()?,
        })
    }

    pub fn version(&self) -> NtfsVersion {
        NtfsVersion::new(self.major, self.minor)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & VOLUME_IS_DIRTY != 0
    }
}

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::attribute::utf16le_to_string;
use crate::error::{NtfsError, Result, require};
use crate::file_name::FileReference;

const ENTRY_MIN: usize = 0x1A;

/// One `$ATTRIBUTE_LIST` entry: where an attribute of the file lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub length: u16,
    pub name: Option<String>,
    pub start_vcn: u64,
    pub reference: FileReference,
    pub attribute_id: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AttributeList {
    pub entries: Vec<AttributeListEntry>,
}

impl AttributeList {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut off = 0usize;
        while off + ENTRY_MIN <= raw.len() {
            let slice = &raw[off..];
            let mut cur = Cursor::new(slice);
            let type_code = cur.read_u32::<LittleEndian>()?;
            let length = cur.read_u16::<LittleEndian>()?;
            if length == 0 {
                break;
            }
            if (length as usize) < ENTRY_MIN {
                return Err(NtfsError::Malformed(format!(
                    "attribute list entry at {} has length {}",
                    off, length
                )));
            }
            require(slice, length as usize, "attribute list entry")?;
            let name_len = cur.read_u8()? as usize;
            let name_off = cur.read_u8()? as usize;
            let start_vcn = cur.read_u64::<LittleEndian>()?;
            let reference = FileReference::from(cur.read_u64::<LittleEndian>()?);
            let attribute_id = cur.read_u16::<LittleEndian>()?;

            let name = if name_len > 0 {
                let end = name_off + name_len * 2;
                require(slice, end, "attribute list entry name")?;
                Some(utf16le_to_string(&slice[name_off..end]))
            } else {
                None
            };

            entries.push(AttributeListEntry {
                type_code,
                length,
                name,
                start_vcn,
                reference,
                attribute_id,
            });
            // entries are 8-byte aligned
            off += (length as usize + 7) & !7;
        }
        Ok(Self { entries })
    }

    pub fn entries_of(&self, type_code: u32) -> impl Iterator<Item = &AttributeListEntry> {
        self.entries.iter().filter(move |e| e.type_code == type_code)
    }
}

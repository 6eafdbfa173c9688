// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (Attribute header)
// - https://en.wikipedia.org/wiki/NTFS

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use core::convert::TryFrom;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::attribute_list::AttributeList;
use crate::data::{AttribData, Bitmap, IndexAllocation};
use crate::data_run::DataRun;
use crate::error::{NtfsError, Result, require};
use crate::file_name::FileName;
use crate::index_root::IndexRoot;
use crate::metadata::{ObjectId, StandardInformation, VolumeInformation, VolumeName};
use crate::volume::Volume;

/// Type code terminating the attribute sequence of a record.
pub const AT_END: u32 = 0xFFFF_FFFF;

/// Name of the file-name index of a directory.
pub const I30: &str = "$I30";

pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

impl TryFrom<u32> for AttributeType {
    type Error = NtfsError;
    fn try_from(value: u32) -> Result<Self> {
        use AttributeType::*;
        Ok(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            other => return Err(NtfsError::UnrecognizedAttribute(other)),
        })
    }
}

/// Additional 8-byte header present only when the attribute is resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub indexed: bool,
}

/// Additional header present only when the attribute is non-resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub first_vcn: u64,
    pub last_vcn: u64,
    pub run_list_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum AttributeForm {
    Resident(ResidentHeader),
    NonResident(NonResidentHeader),
}

/// Attribute descriptor as found in an MFT record. Immutable once decoded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeHeader {
    /// Byte offset of the attribute inside its (fixed-up) record.
    pub offset: usize,
    pub type_code: u32,
    pub length: u32,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
    pub form: AttributeForm,
}

impl AttributeHeader {
    /// Decode the attribute starting at `offset` of `record`. `None` at the
    /// AT_END sentinel or when fewer than 4 bytes remain.
    pub fn decode(record: &[u8], offset: usize) -> Result<Option<Self>> {
        if offset + 4 > record.len() {
            return Ok(None);
        }
        let raw = &record[offset..];
        let mut cur = Cursor::new(raw);
        let type_code = cur.read_u32::<LittleEndian>()?;
        if type_code == AT_END {
            return Ok(None);
        }
        require(raw, 16, "attribute header")?;
        let length = cur.read_u32::<LittleEndian>()?;
        let non_resident = cur.read_u8()? != 0;
        let name_length = cur.read_u8()?;
        let name_offset = cur.read_u16::<LittleEndian>()?;
        let flags = cur.read_u16::<LittleEndian>()?;
        let id = cur.read_u16::<LittleEndian>()?;

        if (length as usize) < 16 || length as usize > raw.len() {
            return Err(NtfsError::Malformed(format!(
                "attribute 0x{:x} at offset {} claims length {} ({} bytes left)",
                type_code,
                offset,
                length,
                raw.len()
            )));
        }
        let raw = &raw[..length as usize];

        let form = if non_resident {
            require(raw, 0x40, "non-resident attribute header")?;
            let first_vcn = cur.read_u64::<LittleEndian>()?;
            let last_vcn = cur.read_u64::<LittleEndian>()?;
            let run_list_offset = cur.read_u16::<LittleEndian>()?;
            let compression_unit = cur.read_u16::<LittleEndian>()?;
            cur.set_position(0x28);
            let allocated_size = cur.read_u64::<LittleEndian>()?;
            let data_size = cur.read_u64::<LittleEndian>()?;
            let initialized_size = cur.read_u64::<LittleEndian>()?;
            AttributeForm::NonResident(NonResidentHeader {
                first_vcn,
                last_vcn,
                run_list_offset,
                compression_unit,
                allocated_size,
                data_size,
                initialized_size,
            })
        } else {
            require(raw, 0x18, "resident attribute header")?;
            let value_length = cur.read_u32::<LittleEndian>()?;
            let value_offset = cur.read_u16::<LittleEndian>()?;
            let indexed = cur.read_u8()? != 0;
            AttributeForm::Resident(ResidentHeader {
                value_length,
                value_offset,
                indexed,
            })
        };

        let name = if name_length > 0 {
            let start = name_offset as usize;
            let end = start + name_length as usize * 2;
            require(raw, end, "attribute name")?;
            Some(utf16le_to_string(&raw[start..end]))
        } else {
            None
        };

        Ok(Some(Self {
            offset,
            type_code,
            length,
            name_length,
            name_offset,
            flags,
            id,
            name,
            form,
        }))
    }

    pub fn attr_type(&self) -> Result<AttributeType> {
        AttributeType::try_from(self.type_code)
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.form, AttributeForm::Resident(_))
    }

    pub fn non_resident(&self) -> Option<&NonResidentHeader> {
        match &self.form {
            AttributeForm::NonResident(nr) => Some(nr),
            AttributeForm::Resident(_) => None,
        }
    }

    /// Part of the `$I30` file-name index.
    pub fn is_file_name_index(&self) -> bool {
        self.name.as_deref() == Some(I30)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & ATTR_FLAG_SPARSE != 0
    }

    /// Logical length of the value.
    pub fn value_length(&self) -> u64 {
        match &self.form {
            AttributeForm::Resident(r) => r.value_length as u64,
            AttributeForm::NonResident(nr) => nr.data_size,
        }
    }

    /// Dereference the value: the inline bytes for a resident attribute, a
    /// fresh [`DataRun`] over the mapping pairs otherwise.
    pub fn value(&self, record: &[u8], bytes_per_cluster: u64) -> Result<AttributeValue> {
        let end = self.offset + self.length as usize;
        require(record, end, "attribute value")?;
        let raw = &record[self.offset..end];
        match &self.form {
            AttributeForm::Resident(r) => {
                let start = r.value_offset as usize;
                let stop = start + r.value_length as usize;
                require(raw, stop, "resident value")?;
                Ok(AttributeValue::Resident(raw[start..stop].to_vec()))
            }
            AttributeForm::NonResident(nr) => {
                let start = nr.run_list_offset as usize;
                if start > raw.len() {
                    return Err(NtfsError::truncated("run list", start, raw.len()));
                }
                let run = DataRun::new(&raw[start..], nr.data_size, bytes_per_cluster)?;
                Ok(AttributeValue::NonResident(run))
            }
        }
    }
}

/// Storage of an attribute value once dereferenced.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Resident(Vec<u8>),
    NonResident(DataRun),
}

impl AttributeValue {
    pub fn length(&self) -> u64 {
        match self {
            AttributeValue::Resident(b) => b.len() as u64,
            AttributeValue::NonResident(run) => run.length(),
        }
    }

    /// Materialise the whole value.
    pub fn into_bytes(self, vol: &mut dyn Volume) -> Result<Vec<u8>> {
        match self {
            AttributeValue::Resident(b) => Ok(b),
            AttributeValue::NonResident(mut run) => run.read_all(vol),
        }
    }
}

/// Typed view over a resolved attribute.
#[derive(Debug, Clone)]
pub enum Attribute {
    StandardInformation(StandardInformation),
    AttributeList(AttributeList),
    FileName(FileName),
    ObjectId(ObjectId),
    VolumeName(VolumeName),
    VolumeInformation(VolumeInformation),
    Data(AttribData),
    IndexRoot(IndexRoot),
    IndexAllocation(IndexAllocation),
    Bitmap(Bitmap),
}

impl Attribute {
    /// Build the variant for `header`. `Ok(None)` for types that are known
    /// but not processed (security descriptors, reparse points, EAs...) and
    /// for index attributes that are not `$I30`.
    pub fn from_header(
        header: &AttributeHeader,
        value: AttributeValue,
        vol: &mut dyn Volume,
    ) -> Result<Option<Self>> {
        use AttributeType as T;
        let attr = match header.attr_type()? {
            T::StandardInformation => {
                Attribute::StandardInformation(StandardInformation::from_bytes(&value.into_bytes(vol)?)?)
            }
            T::FileName => Attribute::FileName(FileName::from_bytes(&value.into_bytes(vol)?)?),
            T::ObjectId => Attribute::ObjectId(ObjectId::from_bytes(&value.into_bytes(vol)?)?),
            T::VolumeName => Attribute::VolumeName(VolumeName::from_bytes(&value.into_bytes(vol)?)),
            T::VolumeInformation => {
                Attribute::VolumeInformation(VolumeInformation::from_bytes(&value.into_bytes(vol)?)?)
            }
            T::AttributeList => Attribute::AttributeList(AttributeList::from_bytes(&value.into_bytes(vol)?)?),
            T::Data => Attribute::Data(AttribData::new(header, value)),
            T::IndexRoot if header.is_file_name_index() => {
                Attribute::IndexRoot(IndexRoot::from_bytes(&value.into_bytes(vol)?)?)
            }
            T::IndexAllocation if header.is_file_name_index() => {
                Attribute::IndexAllocation(IndexAllocation::new(header, value)?)
            }
            T::Bitmap if header.is_file_name_index() => Attribute::Bitmap(Bitmap::new(value.into_bytes(vol)?)),
            _ => return Ok(None),
        };
        Ok(Some(attr))
    }

    pub fn attr_type(&self) -> AttributeType {
        match self {
            Attribute::StandardInformation(_) => AttributeType::StandardInformation,
            Attribute::AttributeList(_) => AttributeType::AttributeList,
            Attribute::FileName(_) => AttributeType::FileName,
            Attribute::ObjectId(_) => AttributeType::ObjectId,
            Attribute::VolumeName(_) => AttributeType::VolumeName,
            Attribute::VolumeInformation(_) => AttributeType::VolumeInformation,
            Attribute::Data(_) => AttributeType::Data,
            Attribute::IndexRoot(_) => AttributeType::IndexRoot,
            Attribute::IndexAllocation(_) => AttributeType::IndexAllocation,
            Attribute::Bitmap(_) => AttributeType::Bitmap,
        }
    }
}

pub(crate) fn utf16le_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Windows FILETIME (100 ns ticks since 1601-01-01) to UTC.
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    const DELTA_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = (ft / 10) as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = (unix_micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

use log::warn;
use std::io::SeekFrom;

use crate::attribute::{ATTR_FLAG_COMPRESSED, ATTR_FLAG_ENCRYPTED, ATTR_FLAG_SPARSE, AttributeHeader, AttributeValue};
use crate::data_run::DataRun;
use crate::error::{NtfsError, Result};
use crate::volume::Volume;

/// A `$DATA` stream, named or not. Resident bytes and non-resident runs are
/// read through the same cursor interface.
#[derive(Debug, Clone)]
pub struct AttribData {
    pub name: Option<String>,
    pub flags: u16,
    value: AttributeValue,
    // data size of the first piece, which covers the whole stream
    declared_size: Option<u64>,
    pos: u64,
}

impl AttribData {
    pub fn new(header: &AttributeHeader, value: AttributeValue) -> Self {
        if header.is_compressed() || header.is_encrypted() {
            warn!(
                "$DATA {:?} is compressed/encrypted (flags 0x{:04x}), returned as stored",
                header.name, header.flags
            );
        }
        let declared_size = header
            .non_resident()
            .filter(|nr| nr.first_vcn == 0 && nr.data_size > 0)
            .map(|nr| nr.data_size);
        Self {
            name: header.name.clone(),
            flags: header.flags,
            value,
            declared_size,
            pos: 0,
        }
    }

    pub fn is_named(&self) -> bool {
        self.name.is_some()
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

    pub fn is_resident(&self) -> bool {
        matches!(self.value, AttributeValue::Resident(_))
    }

    pub fn length(&self) -> u64 {
        self.value.length()
    }

    pub fn data_run(&self) -> Option<&DataRun> {
        match &self.value {
            AttributeValue::NonResident(run) => Some(run),
            AttributeValue::Resident(_) => None,
        }
    }

    pub fn rewind(&mut self) {
        self.seek(SeekFrom::Start(0));
    }

    pub fn seek(&mut self, to: SeekFrom) -> u64 {
        match &mut self.value {
            AttributeValue::NonResident(run) => run.seek(to),
            AttributeValue::Resident(bytes) => {
                let len = bytes.len() as i128;
                let target = match to {
                    SeekFrom::Start(off) => off as i128,
                    SeekFrom::Current(off) => self.pos as i128 + off as i128,
                    SeekFrom::End(off) => len + off as i128,
                };
                self.pos = target.clamp(0, len) as u64;
                self.pos
            }
        }
    }

    pub fn read(&mut self, vol: &mut dyn Volume, n: usize) -> Result<Vec<u8>> {
        match &mut self.value {
            AttributeValue::NonResident(run) => run.read(vol, n),
            AttributeValue::Resident(bytes) => {
                let start = (self.pos as usize).min(bytes.len());
                let end = start.saturating_add(n).min(bytes.len());
                self.pos = end as u64;
                Ok(bytes[start..end].to_vec())
            }
        }
    }

    pub fn read_at(&mut self, vol: &mut dyn Volume, offset: u64, n: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset));
        self.read(vol, n)
    }

    pub fn read_all(&mut self, vol: &mut dyn Volume) -> Result<Vec<u8>> {
        match &mut self.value {
            AttributeValue::NonResident(run) => run.read_all(vol),
            AttributeValue::Resident(bytes) => {
                self.pos = bytes.len() as u64;
                Ok(bytes.clone())
            }
        }
    }

    /// Append the next piece of the same stream found in an extension record.
    pub fn add_run(&mut self, other: &AttribData) -> Result<()> {
        match (&mut self.value, other.data_run()) {
            (AttributeValue::NonResident(run), Some(next)) => {
                run.add_run(next);
                if let Some(size) = self.declared_size {
                    run.truncate(size);
                }
                Ok(())
            }
            _ => Err(NtfsError::Malformed(
                "only non-resident $DATA pieces can be concatenated".into(),
            )),
        }
    }
}

/// `$BITMAP` of an `$I30` index: which index blocks are in use.
#[derive(Debug, Clone, Default)]
pub struct Bitmap {
    data: Vec<u8>,
}

impl Bitmap {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// LSB-first. Bits past the end are unset.
    pub fn is_set(&self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        self.data
            .get(byte)
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    pub fn len_bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }
}

/// One `$INDEX_ALLOCATION` piece of an `$I30` index, covering
/// `first_vcn..=last_vcn` of the allocation.
#[derive(Debug, Clone)]
pub struct IndexAllocation {
    pub first_vcn: u64,
    pub last_vcn: u64,
    pub run: DataRun,
}

impl IndexAllocation {
    pub fn new(header: &AttributeHeader, value: AttributeValue) -> Result<Self> {
        let nr = header
            .non_resident()
            .ok_or_else(|| NtfsError::Malformed("resident $INDEX_ALLOCATION".into()))?;
        let run = match value {
            AttributeValue::NonResident(run) => run,
            AttributeValue::Resident(_) => {
                return Err(NtfsError::Malformed("resident $INDEX_ALLOCATION".into()));
            }
        };
        Ok(Self {
            first_vcn: nr.first_vcn,
            last_vcn: nr.last_vcn,
            run,
        })
    }

    pub fn contains_vcn(&self, vcn: u64) -> bool {
        (self.first_vcn..=self.last_vcn).contains(&vcn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemVolume, non_resident_attr, resident_attr};

    fn header_and_value(attr: &[u8]) -> (AttributeHeader, AttributeValue) {
        let hdr = AttributeHeader::decode(attr, 0).unwrap().unwrap();
        let value = hdr.value(attr, 512).unwrap();
        (hdr, value)
    }

    #[test]
    fn resident_stream_reads_and_seeks() {
        let attr = resident_attr(0x80, "", 0, b"0123456789");
        let (hdr, value) = header_and_value(&attr);
        let mut data = AttribData::new(&hdr, value);
        let mut vol = MemVolume::with_image(Vec::new(), 512);

        assert!(data.is_resident() && !data.is_named());
        assert_eq!(data.read(&mut vol, 4).unwrap(), b"0123");
        assert_eq!(data.read(&mut vol, 4).unwrap(), b"4567");
        assert_eq!(data.seek(SeekFrom::End(-1)), 9);
        assert_eq!(data.read(&mut vol, 4).unwrap(), b"9");
        assert!(data.read(&mut vol, 4).unwrap().is_empty());
        assert_eq!(data.read_at(&mut vol, 2, 3).unwrap(), b"234");
        let copy = data.clone();
        assert!(data.add_run(&copy).is_err());
    }

    #[test]
    fn named_stream_keeps_its_name() {
        let attr = resident_attr(0x80, "Zone.Identifier", 0, b"[ZoneTransfer]");
        let (hdr, value) = header_and_value(&attr);
        let data = AttribData::new(&hdr, value);
        assert_eq!(data.name.as_deref(), Some("Zone.Identifier"));
        assert_eq!(data.length(), 14);
    }

    #[test]
    fn bitmap_is_lsb_first() {
        let bm = Bitmap::new(vec![0b0000_0101, 0b1000_0000]);
        assert!(bm.is_set(0));
        assert!(!bm.is_set(1));
        assert!(bm.is_set(2));
        assert!(bm.is_set(15));
        assert!(!bm.is_set(16));
        assert_eq!(bm.len_bits(), 16);
    }

    #[test]
    fn index_allocation_requires_non_resident() {
        let attr = non_resident_attr(0xA0, "$I30", 0, &[0x11, 0x02, 0x08, 0x00], 2, 3, 1024);
        let (hdr, value) = header_and_value(&attr);
        let alloc = IndexAllocation::new(&hdr, value).unwrap();
        assert!(alloc.contains_vcn(2) && alloc.contains_vcn(3));
        assert!(!alloc.contains_vcn(4) && !alloc.contains_vcn(1));

        let attr = resident_attr(0xA0, "$I30", 0, b"xx");
        let (hdr, value) = header_and_value(&attr);
        assert!(IndexAllocation::new(&hdr, value).is_err());
    }
}

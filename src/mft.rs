// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{Cursor, Read};

use crate::attribute::{Attribute, AttributeHeader, AttributeType};
use crate::attribute_list::{AttributeList, AttributeListEntry};
use crate::data::{AttribData, Bitmap, IndexAllocation};
use crate::error::{NtfsError, Result, require};
use crate::file_name::{FileName, FileReference};
use crate::index_root::IndexRoot;
use crate::metadata::StandardInformation;
use crate::volume::{NtfsVersion, Volume};

pub const FILE_RECORD_IN_USE: u16 = 0x0001;
pub const FILE_RECORD_IS_DIRECTORY: u16 = 0x0002;
/// Set on the `$Extend` sub-files.
pub const FILE_RECORD_IS_4: u16 = 0x0004;
/// Set on records holding a non-`$I30` index.
pub const FILE_RECORD_IS_VIEW_INDEX: u16 = 0x0008;

pub const FILE_SIGNATURE: &[u8; 4] = b"FILE";

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub signature: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: u64,
    pub next_attr_id: u16,
    /// Only in the 3.1+ layout.
    pub record_number: Option<u32>,
}

impl FileRecordHeader {
    pub fn from_bytes(raw: &[u8], version: Option<NtfsVersion>) -> Result<Self> {
        let new_layout = version.is_none_or(|v| v.has_record_number_field());
        require(raw, if new_layout { 0x30 } else { 0x2A }, "FILE record header")?;
        let mut cur = Cursor::new(raw);
        let mut signature = [0u8; 4];
        cur.read_exact(&mut signature)?;
        let usa_offset = cur.read_u16::<LittleEndian>()?;
        let usa_count = cur.read_u16::<LittleEndian>()?;
        let lsn = cur.read_u64::<LittleEndian>()?;
        let sequence_number = cur.read_u16::<LittleEndian>()?;
        let hard_link_count = cur.read_u16::<LittleEndian>()?;
        let attrs_offset = cur.read_u16::<LittleEndian>()?;
        let flags = cur.read_u16::<LittleEndian>()?;
        let bytes_in_use = cur.read_u32::<LittleEndian>()?;
        let bytes_allocated = cur.read_u32::<LittleEndian>()?;
        let base_file_record = cur.read_u64::<LittleEndian>()?;
        let next_attr_id = cur.read_u16::<LittleEndian>()?;
        let record_number = if new_layout {
            cur.set_position(0x2C);
            Some(cur.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        Ok(Self {
            signature,
            usa_offset,
            usa_count,
            lsn,
            sequence_number,
            hard_link_count,
            attrs_offset,
            flags,
            bytes_in_use,
            bytes_allocated,
            base_file_record,
            next_attr_id,
            record_number,
        })
    }
}

/// Undo the multi-sector protection of a FILE or INDX record: the last two
/// bytes of every sector must hold the update sequence number and get their
/// real value back from the update sequence array.
pub(crate) fn apply_fixups(buf: &mut [u8], bytes_per_sector: usize, usa_offset: usize, usa_count: usize) -> Result<()> {
    if usa_count == 0 {
        return Ok(());
    }
    require(buf, usa_offset + 2 * usa_count, "update sequence array")?;
    let usn = [buf[usa_offset], buf[usa_offset + 1]];

    for i in 1..usa_count {
        let sector_end = i * bytes_per_sector;
        require(buf, sector_end, "protected sector")?;
        let tail = sector_end - 2;
        if buf[tail..sector_end] != usn {
            return Err(NtfsError::FixupMismatch { sector: i - 1 });
        }
        let fix = usa_offset + 2 * i;
        buf[tail] = buf[fix];
        buf[tail + 1] = buf[fix + 1];
    }
    trace!("fixups applied to {} sectors", usa_count - 1);
    Ok(())
}

/// Named `$DATA` attribute (alternate data stream).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataStream {
    pub name: String,
    pub size: u64,
    pub resident: bool,
}

#[derive(Debug, Clone, Default)]
struct Resolved {
    ids: Vec<u16>,
    attrs: Vec<Attribute>,
}

/// One decoded MFT record.
///
/// Decoding checks the signature, applies the fixups and enumerates the
/// attribute headers; typed attributes are only built on request and then
/// kept, so asking twice for a type returns the same values without
/// touching the device again. Once the record has an `$ATTRIBUTE_LIST`,
/// lookups go through it and may load extension records.
#[derive(Debug, Clone)]
pub struct MftEntry {
    pub record_number: u64,
    pub header: FileRecordHeader,
    buf: Vec<u8>,
    bytes_per_cluster: u64,
    headers: Vec<AttributeHeader>,
    local: HashMap<AttributeType, Resolved>,
    listed: HashMap<AttributeType, Vec<Attribute>>,
    attribute_list: Option<Option<AttributeList>>,
    data: Option<Option<AttribData>>,
    index_root: Option<Option<IndexRoot>>,
}

impl MftEntry {
    /// Read and decode record `record` of `vol`.
    pub fn load(vol: &mut dyn Volume, record: u64) -> Result<Self> {
        let pos = vol.mft_record_to_byte_position(record)?;
        let size = vol.bytes_per_file_record() as usize;
        let buf = vol.read_bytes(pos, size)?;
        debug!("MFT entry {} read from byte 0x{:X}", record, pos);
        Self::from_bytes(
            buf,
            record,
            vol.bytes_per_sector() as usize,
            vol.bytes_per_cluster(),
            vol.version(),
        )
        .map_err(|e| NtfsError::InvalidEntry {
            record,
            source: Box::new(e),
        })
    }

    pub fn from_bytes(
        mut buf: Vec<u8>,
        record: u64,
        bytes_per_sector: usize,
        bytes_per_cluster: u64,
        version: Option<NtfsVersion>,
    ) -> Result<Self> {
        let header = FileRecordHeader::from_bytes(&buf, version)?;
        if &header.signature != FILE_SIGNATURE {
            return Err(NtfsError::BadSignature {
                expected: "FILE",
                found: String::from_utf8_lossy(&header.signature).into_owned(),
            });
        }
        apply_fixups(
            &mut buf,
            bytes_per_sector,
            header.usa_offset as usize,
            header.usa_count as usize,
        )?;
        if let Some(n) = header.record_number {
            if n as u64 != record & 0xFFFF_FFFF {
                debug!("record {} claims to be record {}", record, n);
            }
        }

        let limit = (header.bytes_in_use as usize).min(buf.len());
        let mut headers = Vec::new();
        let mut offset = header.attrs_offset as usize;
        while let Some(h) = AttributeHeader::decode(&buf[..limit], offset)? {
            offset += h.length as usize;
            headers.push(h);
        }
        trace!("record {}: {} attribute headers", record, headers.len());

        Ok(Self {
            record_number: record,
            header,
            buf,
            bytes_per_cluster,
            headers,
            local: HashMap::new(),
            listed: HashMap::new(),
            attribute_list: None,
            data: None,
            index_root: None,
        })
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn is_in_use(&self) -> bool {
        self.header.flags & FILE_RECORD_IN_USE != 0
    }

    pub fn is_deleted(&self) -> bool {
        !self.is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.header.flags & FILE_RECORD_IS_DIRECTORY != 0
    }

    pub fn is_view_index(&self) -> bool {
        self.header.flags & FILE_RECORD_IS_VIEW_INDEX != 0
    }

    /// Base record of an extension record.
    pub fn base_record(&self) -> Option<FileReference> {
        (self.header.base_file_record != 0).then(|| FileReference::from(self.header.base_file_record))
    }

    /// Attribute headers in record order.
    pub fn headers(&self) -> &[AttributeHeader] {
        &self.headers
    }

    /// Build the attribute behind `headers()[index]`. Fails for attribute
    /// types this crate does not know.
    pub fn resolve_header(&self, vol: &mut dyn Volume, index: usize) -> Result<Option<Attribute>> {
        let header = self
            .headers
            .get(index)
            .ok_or_else(|| NtfsError::NotFound(format!("attribute header #{}", index)))?;
        let value = header.value(&self.buf, self.bytes_per_cluster)?;
        Attribute::from_header(header, value, vol)
    }

    /// Attributes of `ty` stored in this record only.
    pub fn local_attributes(&mut self, vol: &mut dyn Volume, ty: AttributeType) -> Result<&[Attribute]> {
        Ok(&self.resolve_local(vol, ty)?.attrs)
    }

    /// Attributes of `ty`, following the attribute list when there is one.
    pub fn attributes(&mut self, vol: &mut dyn Volume, ty: AttributeType) -> Result<&[Attribute]> {
        if ty == AttributeType::AttributeList || self.attribute_list(vol)?.is_none() {
            return self.local_attributes(vol, ty);
        }
        if !self.listed.contains_key(&ty) {
            let resolved = self.resolve_listed(vol, ty)?;
            self.listed.insert(ty, resolved);
        }
        Ok(self.listed.get(&ty).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn first_attribute(&mut self, vol: &mut dyn Volume, ty: AttributeType) -> Result<Option<&Attribute>> {
        Ok(self.attributes(vol, ty)?.first())
    }

    pub fn attribute_list(&mut self, vol: &mut dyn Volume) -> Result<Option<&AttributeList>> {
        if self.attribute_list.is_none() {
            let list = self
                .local_attributes(vol, AttributeType::AttributeList)?
                .iter()
                .find_map(|a| match a {
                    Attribute::AttributeList(l) => Some(l.clone()),
                    _ => None,
                });
            self.attribute_list = Some(list);
        }
        Ok(self.attribute_list.as_ref().and_then(Option::as_ref))
    }

    pub fn file_names(&mut self, vol: &mut dyn Volume) -> Result<Vec<FileName>> {
        Ok(self
            .attributes(vol, AttributeType::FileName)?
            .iter()
            .filter_map(|a| match a {
                Attribute::FileName(f) => Some(f.clone()),
                _ => None,
            })
            .collect())
    }

    pub fn standard_information(&mut self, vol: &mut dyn Volume) -> Result<Option<StandardInformation>> {
        Ok(self
            .first_attribute(vol, AttributeType::StandardInformation)?
            .and_then(|a| match a {
                Attribute::StandardInformation(si) => Some(si.clone()),
                _ => None,
            }))
    }

    /// The unnamed `$DATA` stream, reassembled from every piece.
    pub fn attribute_data(&mut self, vol: &mut dyn Volume) -> Result<Option<&mut AttribData>> {
        if self.data.is_none() {
            let pieces: Vec<AttribData> = self
                .attributes(vol, AttributeType::Data)?
                .iter()
                .filter_map(|a| match a {
                    Attribute::Data(d) if !d.is_named() => Some(d.clone()),
                    _ => None,
                })
                .collect();
            let mut pieces = pieces.into_iter();
            let data = match pieces.next() {
                Some(mut first) => {
                    for next in pieces {
                        if let Err(e) = first.add_run(&next) {
                            warn!("record {}: $DATA piece skipped: {}", self.record_number, e);
                        }
                    }
                    Some(first)
                }
                None => None,
            };
            self.data = Some(data);
        }
        Ok(self.data.as_mut().and_then(Option::as_mut))
    }

    /// The local unnamed `$DATA`, without looking at the attribute list.
    pub fn root_attribute_data(&mut self, vol: &mut dyn Volume) -> Result<Option<AttribData>> {
        Ok(self
            .local_attributes(vol, AttributeType::Data)?
            .iter()
            .find_map(|a| match a {
                Attribute::Data(d) if !d.is_named() => Some(d.clone()),
                _ => None,
            }))
    }

    /// Named `$DATA` streams of this record.
    pub fn alternate_data_streams(&self) -> Vec<DataStream> {
        self.headers
            .iter()
            .filter(|h| h.type_code == AttributeType::Data as u32)
            .filter_map(|h| {
                h.name.as_ref().map(|name| DataStream {
                    name: name.clone(),
                    size: h.value_length(),
                    resident: h.is_resident(),
                })
            })
            .collect()
    }

    /// Logical size of the unnamed `$DATA`, 0 without one.
    pub fn size(&mut self, vol: &mut dyn Volume) -> Result<u64> {
        Ok(self.attribute_data(vol)?.map_or(0, |d| d.length()))
    }

    /// `$INDEX_ROOT` of the `$I30` index, wired to its `$BITMAP` and every
    /// `$INDEX_ALLOCATION` piece.
    pub fn index_root(&mut self, vol: &mut dyn Volume) -> Result<Option<&mut IndexRoot>> {
        if self.index_root.is_none() {
            let root = self.compose_index_root(vol)?;
            self.index_root = Some(root);
        }
        Ok(self.index_root.as_mut().and_then(Option::as_mut))
    }

    /// Same as [`index_root`](Self::index_root), handing the root over.
    pub fn into_index_root(mut self, vol: &mut dyn Volume) -> Result<Option<IndexRoot>> {
        self.index_root(vol)?;
        Ok(self.index_root.flatten())
    }

    fn compose_index_root(&mut self, vol: &mut dyn Volume) -> Result<Option<IndexRoot>> {
        let mut root = match self.first_attribute(vol, AttributeType::IndexRoot)? {
            Some(Attribute::IndexRoot(root)) => root.clone(),
            _ => return Ok(None),
        };
        let bitmap: Option<Bitmap> = self
            .first_attribute(vol, AttributeType::Bitmap)?
            .and_then(|a| match a {
                Attribute::Bitmap(b) => Some(b.clone()),
                _ => None,
            });
        let allocations: Vec<IndexAllocation> = self
            .attributes(vol, AttributeType::IndexAllocation)?
            .iter()
            .filter_map(|a| match a {
                Attribute::IndexAllocation(ia) => Some(ia.clone()),
                _ => None,
            })
            .collect();
        debug!(
            "record {}: index root with {} allocation piece(s), bitmap {}",
            self.record_number,
            allocations.len(),
            if bitmap.is_some() { "present" } else { "absent" }
        );
        root.set_bitmap(bitmap);
        root.set_allocations(allocations);
        Ok(Some(root))
    }

    fn resolve_local(&mut self, vol: &mut dyn Volume, ty: AttributeType) -> Result<&Resolved> {
        if !self.local.contains_key(&ty) {
            let mut resolved = Resolved::default();
            for h in self.headers.iter().filter(|h| h.type_code == ty as u32) {
                let value = h.value(&self.buf, self.bytes_per_cluster)?;
                if let Some(attr) = Attribute::from_header(h, value, vol)? {
                    resolved.ids.push(h.id);
                    resolved.attrs.push(attr);
                }
            }
            debug!("record {}: resolved {} {:?}", self.record_number, resolved.attrs.len(), ty);
            self.local.insert(ty, resolved);
        }
        self.local
            .get(&ty)
            .ok_or_else(|| NtfsError::NotFound(format!("{:?}", ty)))
    }

    // The local attribute `ty` with instance id `id`.
    fn attribute_by_id(&mut self, vol: &mut dyn Volume, ty: AttributeType, id: u16) -> Result<Option<Attribute>> {
        let resolved = self.resolve_local(vol, ty)?;
        Ok(resolved
            .ids
            .iter()
            .position(|i| *i == id)
            .map(|at| resolved.attrs[at].clone()))
    }

    fn resolve_listed(&mut self, vol: &mut dyn Volume, ty: AttributeType) -> Result<Vec<Attribute>> {
        let wanted: Vec<AttributeListEntry> = match self.attribute_list(vol)? {
            Some(list) => list.entries_of(ty as u32).cloned().collect(),
            None => return Ok(Vec::new()),
        };
        let mut extensions: HashMap<u64, MftEntry> = HashMap::new();
        let mut out = Vec::new();
        for e in wanted {
            let record = e.reference.record;
            let found = if record == self.record_number {
                self.attribute_by_id(vol, ty, e.attribute_id)?
            } else {
                if !extensions.contains_key(&record) {
                    debug!("record {}: loading extension record {}", self.record_number, record);
                    extensions.insert(record, vol.mft_entry(record)?);
                }
                match extensions.get_mut(&record) {
                    Some(ext) => ext.attribute_by_id(vol, ty, e.attribute_id)?,
                    None => None,
                }
            };
            match found {
                Some(attr) => out.push(attr),
                None => warn!(
                    "record {}: listed {:?} #{} not found in record {}",
                    self.record_number, ty, e.attribute_id, record
                ),
            }
        }
        Ok(out)
    }

    /// Human readable summary, one table per section.
    pub fn to_table(&mut self, vol: &mut dyn Volume) -> Result<String> {
        let mut out = String::new();

        let mut hdr = Table::new();
        hdr.add_row(row!["MFT Entry Header Values"]);
        hdr.add_row(row![b -> "Record", self.record_number]);
        hdr.add_row(row![b -> "Sequence", self.header.sequence_number]);
        hdr.add_row(row![b -> "$LogFile Sequence Number", self.header.lsn]);
        hdr.add_row(row![b -> "Flags", record_flags_to_string(self.header.flags)]);
        hdr.add_row(row![b -> "Links", self.header.hard_link_count]);
        if let Some(base) = self.base_record() {
            hdr.add_row(row![b -> "Base Record", base.record]);
        }
        out.push_str(&hdr.to_string());

        let mut attrs = Table::new();
        attrs.add_row(row!["Attributes", "Name", "Status", "Size"]);
        for h in &self.headers {
            let ty = h
                .attr_type()
                .map(|t| format!("{:?}", t))
                .unwrap_or_else(|_| "Unknown".into());
            attrs.add_row(row![
                format!("{} (0x{:X}-#{})", ty, h.type_code, h.id),
                h.name.clone().unwrap_or_else(|| "N/A".to_string()),
                if h.is_resident() { "Resident" } else { "Non-resident" },
                h.value_length()
            ]);
        }
        out.push('\n');
        out.push_str(&attrs.to_string());

        if let Some(si) = self.standard_information(vol)? {
            let rfc = |ft: u64| crate::attribute::filetime_to_datetime(ft).map_or("-".into(), |d| d.to_rfc3339());
            let mut t = Table::new();
            t.add_row(row!["$STANDARD_INFORMATION"]);
            t.add_row(row![b -> "Created", rfc(si.created)]);
            t.add_row(row![b -> "File Modified", rfc(si.modified)]);
            t.add_row(row![b -> "MFT Modified", rfc(si.mft_modified)]);
            t.add_row(row![b -> "Accessed", rfc(si.accessed)]);
            t.add_row(row![b -> "Flags", si_flags_to_string(si.file_attrs)]);
            t.add_row(row![b -> "Owner ID", si.owner_id.map_or("-".into(), |v| v.to_string())]);
            t.add_row(row![b -> "Security ID", si.security_id.map_or("-".into(), |v| v.to_string())]);
            if let Some(u) = si.usn {
                t.add_row(row![b -> "Last USN", u]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        let names = self.file_names(vol)?;
        if !names.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["$FILE_NAME Attributes"]);
            for fname in names {
                t.add_row(row![b -> "Name", fname.name.clone()]);
                t.add_row(row![b -> "Parent MFT", format!("{} (seq {})", fname.parent.record, fname.parent.sequence)]);
                t.add_row(row![b -> "Allocated", fname.allocated_size]);
                t.add_row(row![b -> "Actual", fname.data_size]);
                t.add_row(row![b -> "Namespace", fname.namespace]);
                t.add_row(row!["", ""]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        let ads = self.alternate_data_streams();
        if !ads.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["Alternate Data Streams"]);
            t.add_row(row![b -> "Name", "Size", "Resident"]);
            for s in ads {
                t.add_row(row![s.name, s.size, if s.resident { "Yes" } else { "No" }]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        Ok(out)
    }

    pub fn to_json(&mut self, vol: &mut dyn Volume) -> Result<Value> {
        let names: Vec<Value> = self.file_names(vol)?.iter().map(FileName::to_json).collect();
        let si = self.standard_information(vol)?;
        let size = self.size(vol)?;
        Ok(json!({
            "record": self.record_number,
            "header": &self.header,
            "attributes": &self.headers,
            "standard_information": si,
            "file_names": names,
            "size": size,
            "ads": self.alternate_data_streams(),
        }))
    }
}

/// Decode MFT record flags.
fn record_flags_to_string(flags: u16) -> String {
    let mut v = Vec::new();
    if flags & FILE_RECORD_IN_USE != 0 {
        v.push("Allocated")
    }
    if flags & FILE_RECORD_IS_DIRECTORY != 0 {
        v.push("Directory")
    }
    if flags & FILE_RECORD_IS_4 != 0 {
        v.push("Extend")
    }
    if flags & FILE_RECORD_IS_VIEW_INDEX != 0 {
        v.push("View Index")
    }
    if v.is_empty() {
        "None".into()
    } else {
        v.join(" | ")
    }
}

/// Decode FILE attribute flags inside $STANDARD_INFORMATION.
fn si_flags_to_string(flags: u32) -> String {
    const NAMES: [(u32, &str); 11] = [
        (0x0001, "READONLY"),
        (0x0002, "HIDDEN"),
        (0x0004, "SYSTEM"),
        (0x0020, "ARCHIVE"),
        (0x0100, "TEMPORARY"),
        (0x0200, "SPARSE_FILE"),
        (0x0400, "REPARSE_POINT"),
        (0x0800, "COMPRESSED"),
        (0x1000, "OFFLINE"),
        (0x2000, "NOT_INDEXED"),
        (0x4000, "ENCRYPTED"),
    ];
    let v: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if v.is_empty() { "NONE".into() } else { v.join(" | ") }
}

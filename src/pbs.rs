// Sources:
// - https://en.wikipedia.org/wiki/NTFS
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (BIOS parameter block)

//! Partition boot sector of an NTFS volume.

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::io::{Cursor, Read};

use crate::error::{NtfsError, Result, require};

pub const BOOT_SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    pub jump_instruction: [u8; 3],
    pub oem_id: [u8; 8],

    // BIOS parameter block
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,

    // extended BPB
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_mirror_cluster: u64,
    /// Negative values encode `2^-n` bytes.
    pub clusters_per_file_record: i8,
    pub clusters_per_index_buffer: i8,
    pub volume_serial_number: u64,
    pub checksum: u32,

    pub end_of_sector_marker: u16,
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
    pub const END_MARKER: u16 = 0xAA55;

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        require(buf, BOOT_SECTOR_SIZE, "boot sector")?;
        let mut c = Cursor::new(buf);

        macro_rules! read_array {
            ($len:expr) => {{
                let mut tmp = [0u8; $len];
                c.read_exact(&mut tmp)?;
                tmp
            }};
        }
        macro_rules! skip {
            ($len:expr) => {
                c.set_position(c.position() + $len)
            };
        }

        let jump_instruction = read_array!(3);
        let oem_id = read_array!(8);
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        let reserved_sectors = c.read_u16::<LittleEndian>()?;
        skip!(5);
        let media_descriptor = c.read_u8()?;
        skip!(2);
        let sectors_per_track = c.read_u16::<LittleEndian>()?;
        let number_of_heads = c.read_u16::<LittleEndian>()?;
        let hidden_sectors = c.read_u32::<LittleEndian>()?;
        skip!(8);
        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        skip!(3);
        let clusters_per_index_buffer = c.read_i8()?;
        skip!(3);
        let volume_serial_number = c.read_u64::<LittleEndian>()?;
        let checksum = c.read_u32::<LittleEndian>()?;
        c.set_position(0x1FE);
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        Ok(Self {
            jump_instruction,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            media_descriptor,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            clusters_per_index_buffer,
            volume_serial_number,
            checksum,
            end_of_sector_marker,
        })
    }

    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    /// Reject geometry the rest of the parser cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.oem_id_is_valid() {
            return Err(NtfsError::BootSector(format!(
                "OEM id {:?} is not NTFS",
                String::from_utf8_lossy(&self.oem_id)
            )));
        }
        if self.bytes_per_sector < 256 || !self.bytes_per_sector.is_power_of_two() {
            return Err(NtfsError::BootSector(format!(
                "{} bytes per sector",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 {
            return Err(NtfsError::BootSector("0 sectors per cluster".into()));
        }
        if self.file_record_size() == 0 || self.file_record_size() > self.cluster_size() * 64 {
            return Err(NtfsError::BootSector(format!(
                "file record size {}",
                self.file_record_size()
            )));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }

    /// Bytes per file-record segment.
    pub fn file_record_size(&self) -> u64 {
        self.clusters_to_bytes(self.clusters_per_file_record)
    }

    /// Bytes per INDX block.
    pub fn index_record_size(&self) -> u64 {
        self.clusters_to_bytes(self.clusters_per_index_buffer)
    }

    fn clusters_to_bytes(&self, raw: i8) -> u64 {
        match raw {
            0 => 0,
            1.. => raw as u64 * self.cluster_size(),
            _ => 1u64.checked_shl(-(raw as i32) as u32).unwrap_or(0),
        }
    }

    /// Byte offset of record 0 of `$MFT`.
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size()
    }

    pub fn mft_mirror_address(&self) -> u64 {
        self.mft_mirror_cluster * self.cluster_size()
    }

    pub fn volume_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }

    pub fn to_json(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut v {
            map.insert("cluster_size".into(), json!(self.cluster_size()));
            map.insert("file_record_size".into(), json!(self.file_record_size()));
            map.insert("index_record_size".into(), json!(self.index_record_size()));
            map.insert("mft_address".into(), json!(self.mft_address()));
        }
        v
    }
}

impl fmt::Display for PartitionBootSector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = Table::new();
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Cluster size", self.cluster_size()]);
        t.add_row(row![b -> "Media descriptor", format!("0x{:02X}", self.media_descriptor)]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "Volume size", self.volume_size()]);
        t.add_row(row![b -> "$MFT cluster", format!("{} (byte 0x{:X})", self.mft_cluster, self.mft_address())]);
        t.add_row(row![b -> "$MFTMirr cluster", format!("{} (byte 0x{:X})", self.mft_mirror_cluster, self.mft_mirror_address())]);
        t.add_row(row![b -> "File record size", self.file_record_size()]);
        t.add_row(row![b -> "Index record size", self.index_record_size()]);
        t.add_row(row![b -> "Serial number", format!("{:016X}", self.volume_serial_number)]);
        t.add_row(row![b -> "End marker", format!("0x{:04X}", self.end_of_sector_marker)]);
        write!(f, "{}", t)
    }
}

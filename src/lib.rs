// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use log::{debug, error, info, trace, warn};
use std::io::{Read, Seek, SeekFrom};

pub mod attribute;
pub mod attribute_list;
pub mod cluster_cache;
pub mod data;
pub mod data_run;
pub mod error;
pub mod file_name;
pub mod fs;
pub mod index;
pub mod index_root;
pub mod metadata;
pub mod mft;
pub mod path_cache;
pub mod pbs;
pub mod run_list;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{NtfsError, Result};
pub use fs::{FileStat, FileSystem, FsConfig};
pub use mft::MftEntry;
pub use volume::{NtfsVersion, Volume};

use attribute::{Attribute, AttributeType};
use metadata::{VolumeInformation, VolumeName};
use pbs::{BOOT_SECTOR_SIZE, PartitionBootSector};
use run_list::Run;

/// MFT record of `$Volume`.
pub const VOLUME_RECORD: u64 = 3;

/// An NTFS volume on top of any seekable byte stream.
#[derive(Debug)]
pub struct NtfsVolume<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    pub body: T,
    // run list of $MFT itself, None while bootstrapping from record 0
    mft_runs: Option<Vec<Run>>,
    version: Option<NtfsVersion>,
}

impl<T: Read + Seek> NtfsVolume<T> {
    /// Parse the boot sector, then locate `$MFT` and read the volume version.
    pub fn new(mut body: T) -> Result<Self> {
        body.seek(SeekFrom::Start(0))?;
        let mut sector = vec![0u8; BOOT_SECTOR_SIZE];
        body.read_exact(&mut sector)?;
        let pbs = PartitionBootSector::from_bytes(&sector)?;
        if let Err(e) = pbs.validate() {
            error!("{}", e);
            return Err(e);
        }

        let mut vol = Self {
            pbs,
            body,
            mft_runs: None,
            version: None,
        };
        vol.load_mft_runs()?;
        vol.load_version();
        Ok(vol)
    }

    fn load_mft_runs(&mut self) -> Result<()> {
        debug!("loading the $MFT run list from record 0");
        let mut rec0 = MftEntry::load(self, 0)?;
        let data = rec0
            .root_attribute_data(self)?
            .ok_or_else(|| NtfsError::NotFound("unnamed $DATA in $MFT record 0".into()))?;
        let runs = data
            .data_run()
            .map(|run| run.runs().to_vec())
            .ok_or_else(|| NtfsError::Malformed("resident $DATA in $MFT record 0".into()))?;
        debug!("$MFT spans {} runs", runs.len());
        self.mft_runs = Some(runs);
        Ok(())
    }

    fn load_version(&mut self) {
        match self.volume_information() {
            Ok(Some(vi)) => {
                info!("NTFS version {}", vi.version());
                if vi.is_dirty() {
                    warn!("volume is marked dirty");
                }
                self.version = Some(vi.version());
            }
            Ok(None) => warn!("$Volume has no $VOLUME_INFORMATION, assuming 3.1 records"),
            Err(e) => warn!("could not read the volume version ({}), assuming 3.1 records", e),
        }
    }

    /// `$VOLUME_INFORMATION` of `$Volume`.
    pub fn volume_information(&mut self) -> Result<Option<VolumeInformation>> {
        let mut rec = self.mft_entry(VOLUME_RECORD)?;
        Ok(match rec.first_attribute(self, AttributeType::VolumeInformation)? {
            Some(Attribute::VolumeInformation(vi)) => Some(vi.clone()),
            _ => None,
        })
    }

    /// `$VOLUME_NAME` of `$Volume`.
    pub fn volume_name(&mut self) -> Result<Option<VolumeName>> {
        let mut rec = self.mft_entry(VOLUME_RECORD)?;
        Ok(match rec.first_attribute(self, AttributeType::VolumeName)? {
            Some(Attribute::VolumeName(name)) => Some(name.clone()),
            _ => None,
        })
    }

    pub fn mft_runs(&self) -> &[Run] {
        self.mft_runs.as_deref().unwrap_or_default()
    }

    /// Number of record slots covered by the `$MFT` run list.
    pub fn mft_records_count(&self) -> u64 {
        let clusters: u64 = self.mft_runs().iter().map(|r| r.length).sum();
        clusters * self.pbs.cluster_size() / self.pbs.file_record_size()
    }

    /// Every decodable record, in record order. Records failing signature
    /// or fixup checks are skipped.
    pub fn records(&mut self) -> impl Iterator<Item = MftEntry> + '_ {
        let count = self.mft_records_count();
        (0..count).filter_map(move |n| match self.mft_entry(n) {
            Ok(entry) => Some(entry),
            Err(e) if e.is_corruption() => {
                debug!("skipping MFT record {}: {}", n, e);
                None
            }
            Err(e) => {
                warn!("skipping MFT record {}: {}", n, e);
                None
            }
        })
    }
}

impl<T: Read + Seek> Volume for NtfsVolume<T> {
    fn bytes_per_cluster(&self) -> u64 {
        self.pbs.cluster_size()
    }

    fn bytes_per_sector(&self) -> u64 {
        self.pbs.bytes_per_sector as u64
    }

    fn bytes_per_file_record(&self) -> u64 {
        self.pbs.file_record_size()
    }

    fn version(&self) -> Option<NtfsVersion> {
        self.version
    }

    fn mft_record_to_byte_position(&self, record: u64) -> Result<u64> {
        let byte = record
            .checked_mul(self.pbs.file_record_size())
            .ok_or_else(|| NtfsError::NotFound(format!("MFT record {} is past the end of $MFT", record)))?;
        let Some(runs) = &self.mft_runs else {
            // bootstrap: the first records sit at the start of the first extent
            return Ok(self.pbs.mft_address() + byte);
        };

        let bpc = self.pbs.cluster_size();
        let vcn = byte / bpc;
        let mut base_vcn = 0u64;
        for run in runs {
            if vcn < base_vcn + run.length {
                let lcn = run
                    .lcn
                    .ok_or_else(|| NtfsError::Malformed(format!("MFT record {} lies in a sparse run", record)))?;
                return Ok(self.logical_cluster_to_absolute_byte(lcn + (vcn - base_vcn))? + byte % bpc);
            }
            base_vcn += run.length;
        }
        Err(NtfsError::NotFound(format!("MFT record {} is past the end of $MFT", record)))
    }

    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        trace!("device read of {} bytes at 0x{:X}", len, offset);
        self.body.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        (&mut self.body).take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn mft_entry(&mut self, record: u64) -> Result<MftEntry> {
        MftEntry::load(self, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mft::FILE_RECORD_IN_USE;
    use crate::pbs::tests::boot_sector;
    use crate::test_support::{encode_runs, file_record, non_resident_attr, resident_attr};
    use std::io::Cursor;

    const BPC: usize = 4096;

    // $MFT at LCN 4..6 (8 records), then more records at LCN 9
    fn image() -> Vec<u8> {
        let mut img = vec![0u8; 12 * BPC];
        img[..BOOT_SECTOR_SIZE].copy_from_slice(&boot_sector());

        let runs = encode_runs(&[Run { lcn: Some(4), length: 2 }, Run { lcn: Some(9), length: 1 }]);
        let data = non_resident_attr(0x80, "", 1, &runs, 0, 2, 3 * BPC as u64);
        let mut put = |at: usize, rec: Vec<u8>| img[at..at + rec.len()].copy_from_slice(&rec);
        put(4 * BPC, file_record(0, FILE_RECORD_IN_USE, &[data]));

        let mut vi = vec![0u8; 12];
        vi[8] = 3;
        vi[9] = 1;
        let name: Vec<u8> = "DATA".encode_utf16().flat_map(u16::to_le_bytes).collect();
        put(
            4 * BPC + 3 * 1024,
            file_record(3, FILE_RECORD_IN_USE, &[resident_attr(0x60, "", 0, &name), resident_attr(0x70, "", 1, &vi)]),
        );
        // record 9 is the second record of the extent at LCN 9
        put(9 * BPC + 1024, file_record(9, FILE_RECORD_IN_USE, &[]));
        img
    }

    #[test]
    fn opens_volume_and_reads_version() {
        let mut vol = NtfsVolume::new(Cursor::new(image())).unwrap();
        assert_eq!(vol.version(), Some(NtfsVersion::V3_1));
        assert_eq!(vol.mft_records_count(), 12);
        assert_eq!(vol.volume_name().unwrap().unwrap().name, "DATA");
    }

    #[test]
    fn maps_records_through_the_run_list() {
        let mut vol = NtfsVolume::new(Cursor::new(image())).unwrap();
        assert_eq!(vol.mft_record_to_byte_position(1).unwrap(), 4 * BPC as u64 + 1024);
        assert_eq!(vol.mft_record_to_byte_position(9).unwrap(), 9 * BPC as u64 + 1024);
        assert!(vol.mft_record_to_byte_position(12).is_err());
        assert_eq!(vol.mft_entry(9).unwrap().header.record_number, Some(9));
    }

    #[test]
    fn enumeration_skips_empty_records() {
        let mut vol = NtfsVolume::new(Cursor::new(image())).unwrap();
        let found: Vec<u64> = vol.records().map(|e| e.record_number).collect();
        assert_eq!(found, [0, 3, 9]);
    }

    #[test]
    fn enumeration_skips_records_with_torn_sectors() {
        let mut img = image();
        let at = 4 * BPC + 5 * 1024;
        img[at..at + 1024].copy_from_slice(&file_record(5, FILE_RECORD_IN_USE, &[]));
        // second sector no longer ends with the update sequence number
        img[at + 1022] ^= 0xFF;
        let mut vol = NtfsVolume::new(Cursor::new(img)).unwrap();
        assert!(matches!(vol.mft_entry(5), Err(NtfsError::FixupMismatch { .. })));
        let found: Vec<u64> = vol.records().map(|e| e.record_number).collect();
        assert_eq!(found, [0, 3, 9]);
    }

    #[test]
    fn foreign_boot_sector_is_rejected() {
        let mut img = image();
        img[3..11].copy_from_slice(b"EXFAT   ");
        assert!(matches!(NtfsVolume::new(Cursor::new(img)), Err(NtfsError::BootSector(_))));
    }
}

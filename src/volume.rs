use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NtfsError, Result};
use crate::mft::MftEntry;

/// NTFS on-disk version as stored in `$Volume:$VOLUME_INFORMATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct NtfsVersion {
    pub major: u8,
    pub minor: u8,
}

impl NtfsVersion {
    pub const V3_1: NtfsVersion = NtfsVersion { major: 3, minor: 1 };

    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Records written before 3.1 lack the alignment word and the record
    /// number at offsets 0x2A/0x2C of the FILE header.
    pub fn has_record_number_field(&self) -> bool {
        *self >= Self::V3_1
    }
}

impl fmt::Display for NtfsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the core parser needs from the volume it runs on.
///
/// The byte stream is owned by the implementor and shared by every
/// [`DataRun`](crate::data_run::DataRun) through `read_bytes`; nothing in the
/// core closes or reopens it.
pub trait Volume {
    fn bytes_per_cluster(&self) -> u64;

    fn bytes_per_sector(&self) -> u64;

    fn bytes_per_file_record(&self) -> u64;

    /// `None` while the version is still unknown (e.g. during bootstrap).
    fn version(&self) -> Option<NtfsVersion>;

    fn mft_record_to_byte_position(&self, record: u64) -> Result<u64>;

    fn logical_cluster_to_absolute_byte(&self, lcn: u64) -> Result<u64> {
        lcn.checked_mul(self.bytes_per_cluster())
            .ok_or_else(|| NtfsError::Malformed(format!("LCN {} is past the addressable range", lcn)))
    }

    /// Seek to `offset` and read exactly `len` bytes.
    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Decode the MFT record `record`.
    fn mft_entry(&mut self, record: u64) -> Result<MftEntry>;
}

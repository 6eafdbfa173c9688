use thiserror::Error;

/// Everything that can go wrong while decoding a volume.
///
/// Structural corruption fails the single entity being decoded. Logical
/// absence (missing name, unset bitmap bit, no index root) is never an error
/// and shows up as `None` instead.
#[derive(Debug, Error)]
pub enum NtfsError {
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("bad signature: expected {expected:?}, found {found:?}")]
    BadSignature {
        expected: &'static str,
        found: String,
    },

    #[error("fixup marker mismatch at sector {sector}")]
    FixupMismatch { sector: usize },

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("malformed run list: {0}")]
    MalformedRunList(String),

    #[error("invalid MFT entry <{record}>: {source}")]
    InvalidEntry {
        record: u64,
        #[source]
        source: Box<NtfsError>,
    },

    #[error("unrecognized attribute type: 0x{0:08x}")]
    UnrecognizedAttribute(u32),

    #[error("malformed structure: {0}")]
    Malformed(String),

    #[error("invalid boot sector: {0}")]
    BootSector(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("writes not supported")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, NtfsError>;

impl NtfsError {
    pub(crate) fn truncated(what: &'static str, need: usize, have: usize) -> Self {
        NtfsError::Truncated { what, need, have }
    }

    /// True for failures that make the decoded entity unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            NtfsError::BadSignature { .. }
                | NtfsError::FixupMismatch { .. }
                | NtfsError::Truncated { .. }
                | NtfsError::MalformedRunList(_)
                | NtfsError::InvalidEntry { .. }
                | NtfsError::Malformed(_)
        )
    }
}

// Cursor reads that run off their buffer are truncation, not device failure.
impl From<std::io::Error> for NtfsError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NtfsError::truncated("field", 0, 0)
        } else {
            NtfsError::Io(e)
        }
    }
}

/// Fails with `Truncated` unless `buf` holds at least `need` bytes.
pub(crate) fn require(buf: &[u8], need: usize, what: &'static str) -> Result<()> {
    if buf.len() < need {
        return Err(NtfsError::truncated(what, need, buf.len()));
    }
    Ok(())
}

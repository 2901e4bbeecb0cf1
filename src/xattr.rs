//! Extended-attribute names and the backup-service metadata record layout.

use crate::error::{DmResult, OsError};
use crate::flags::XAttrFlags;
use crate::location::Uuid;

pub const OPAR_XATTR_ARCHIVE_SIZE: &str = "OPAR_XATTR_ARCHIVE_SIZE";
pub const OPAR_XATTR_ARCHIVE_BLOCKS: &str = "OPAR_XATTR_ARCHIVE_BLOCKS";
pub const OPAR_XATTR_ARCHIVE_BLOCKSIZE: &str = "OPAR_XATTR_ARCHIVE_BLOCKSIZE";
pub const OPAR_XATTR_ARCHIVE_UUID: &str = "OPAR_XATTR_ARCHIVE_UUID";
pub const OPAR_XATTR_PRODUCT_ID: &str = "OPAR_XATTR_PRODUCT_ID";
pub const OPAR_XATTR_STORE_ID: &str = "OPAR_XATTR_STORE_ID";

/// The six attributes backup-completion marks on the source file and archive-completion marks: kept as
/// one list so both workers enumerate the same names the testable-property
/// "six source xattrs present post-run" checks against.
pub const BACKUP_COMPLETION_XATTRS: [&str; 3] = [
    OPAR_XATTR_ARCHIVE_UUID,
    OPAR_XATTR_PRODUCT_ID,
    OPAR_XATTR_STORE_ID,
];

pub const ARCHIVE_XATTRS: [&str; 3] = [
    OPAR_XATTR_ARCHIVE_SIZE,
    OPAR_XATTR_ARCHIVE_BLOCKS,
    OPAR_XATTR_ARCHIVE_BLOCKSIZE,
];

/// The 24-byte backup-service item-header record: `uuid(16) ||
/// little_endian_u64(file_length)`. Metadata ID = `0x01`.
pub const METADATA_RECORD_ID: u8 = 0x01;
pub const METADATA_RECORD_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecord {
    pub uuid: Uuid,
    pub file_length: u64,
}

impl MetadataRecord {
    pub fn encode(&self) -> [u8; METADATA_RECORD_LEN] {
        let mut buf = [0u8; METADATA_RECORD_LEN];
        buf[..16].copy_from_slice(&self.uuid.0);
        buf[16..24].copy_from_slice(&self.file_length.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> DmResult<Self> {
        if bytes.len() != METADATA_RECORD_LEN {
            return Err(OsError::new(libc::EILSEQ, format!(
                "metadata record must be {METADATA_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[..16]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[16..24]);
        Ok(Self {
            uuid: Uuid(uuid),
            file_length: u64::from_le_bytes(len_bytes),
        })
    }
}

/// Create-or-replace semantics for xattr writes: attempt without
/// flags first; on `EEXIST`, retry with `REPLACE`.
pub fn set_create_or_replace<F>(mut set: F) -> DmResult<()>
where
    F: FnMut(XAttrFlags) -> DmResult<()>,
{
    match set(XAttrFlags::empty()) {
        Err(e) if e.raw_error() == libc::EEXIST => set(XAttrFlags::REPLACE),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_record_round_trips() {
        let rec = MetadataRecord { uuid: Uuid([7; 16]), file_length: 5 * 1024 * 1024 };
        let encoded = rec.encode();
        assert_eq!(encoded.len(), METADATA_RECORD_LEN);
        let decoded = MetadataRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn metadata_record_rejects_wrong_length() {
        assert!(MetadataRecord::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn single_file_backup_scenario_metadata() {
        // a 5 MiB file.
        let rec = MetadataRecord { uuid: Uuid([0xAB; 16]), file_length: 5 * 1024 * 1024 };
        let encoded = rec.encode();
        assert_eq!(&encoded[16..24], &(5u64 * 1024 * 1024).to_le_bytes());
    }

    #[test]
    fn create_or_replace_retries_on_eexist() {
        let mut calls = Vec::new();
        let result = set_create_or_replace(|flags| {
            calls.push(flags);
            if flags.is_empty() {
                Err(OsError::new(libc::EEXIST, "exists"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, vec![XAttrFlags::empty(), XAttrFlags::REPLACE]);
    }
}

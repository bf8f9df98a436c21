use bitflags::bitflags;
use log::{debug, warn};

use crate::err::{DeserializationError, FormatError};
use crate::utils::ByteCursor;

pub const EVTX_FILE_HEADER_MAGIC: &[u8; 8] = b"ElfFile\x00";
/// The header occupies a whole block, chunks start right after it.
pub const EVTX_FILE_HEADER_BLOCK_SIZE: usize = 4096;
/// The checksum covers the first 120 bytes of the header.
const EVTX_FILE_HEADER_CHECKSUM_RANGE: usize = 120;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EvtxFileHeader {
    pub first_chunk_number: u64,
    pub last_chunk_number: u64,
    pub next_record_id: u64,
    pub header_size: u32,
    pub minor_version: u16,
    pub major_version: u16,
    pub header_block_size: u16,
    pub chunk_count: u16,
    pub flags: HeaderFlags,
    pub checksum: u32,
    computed_checksum: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const DIRTY = 0x1;
        const FULL = 0x2;
    }
}

impl EvtxFileHeader {
    /// Parse the file header at the start of `data`.
    ///
    /// Rejects the input only when the magic is wrong or the header is cut short. A checksum
    /// mismatch is logged and can be queried with [`EvtxFileHeader::validate_checksum`].
    pub fn from_bytes(data: &[u8]) -> Result<EvtxFileHeader, FormatError> {
        let mut cursor = ByteCursor::new(data);
        let truncated = |source: DeserializationError| FormatError::Truncated { source };

        let magic = cursor.array::<8>("file header magic").map_err(truncated)?;
        if &magic != EVTX_FILE_HEADER_MAGIC {
            return Err(FormatError::InvalidMagic { magic });
        }

        let first_chunk_number = cursor.u64_named("first chunk number").map_err(truncated)?;
        let last_chunk_number = cursor.u64_named("last chunk number").map_err(truncated)?;
        let next_record_id = cursor.u64_named("next record id").map_err(truncated)?;
        let header_size = cursor.u32_named("header size").map_err(truncated)?;
        let minor_version = cursor.u16_named("minor version").map_err(truncated)?;
        let major_version = cursor.u16_named("major version").map_err(truncated)?;
        let header_block_size = cursor.u16_named("header block size").map_err(truncated)?;
        let chunk_count = cursor.u16_named("chunk count").map_err(truncated)?;

        // Unused.
        cursor.advance(76, "file header padding").map_err(truncated)?;

        let flags = HeaderFlags::from_bits_retain(cursor.u32_named("file flags").map_err(truncated)?);
        let checksum = cursor.u32_named("file header checksum").map_err(truncated)?;
        let computed_checksum = crc32fast::hash(&data[..EVTX_FILE_HEADER_CHECKSUM_RANGE]);

        if (major_version, minor_version) != (3, 1) {
            debug!(
                "Unexpected EVTX version {}.{}, parsing anyway",
                major_version, minor_version
            );
        }

        let header = EvtxFileHeader {
            first_chunk_number,
            last_chunk_number,
            next_record_id,
            header_size,
            minor_version,
            major_version,
            header_block_size,
            chunk_count,
            flags,
            checksum,
            computed_checksum,
        };

        if let Err(e) = header.validate_checksum() {
            warn!("{}", e);
        }

        Ok(header)
    }

    pub fn validate_checksum(&self) -> Result<(), FormatError> {
        if self.checksum == self.computed_checksum {
            Ok(())
        } else {
            Err(FormatError::ChecksumMismatch {
                expected: self.checksum,
                found: self.computed_checksum,
            })
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(HeaderFlags::DIRTY)
    }

    pub fn is_full(&self) -> bool {
        self.flags.contains(HeaderFlags::FULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::synthetic::{FileHeaderOptions, build_file_header};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_evtx_file_header() {
        let raw = build_file_header(&FileHeaderOptions {
            chunk_count: 26,
            next_record_id: 2226,
            flags: 0x1,
        });

        let header = EvtxFileHeader::from_bytes(&raw).unwrap();
        assert_eq!(
            header,
            EvtxFileHeader {
                first_chunk_number: 0,
                last_chunk_number: 25,
                next_record_id: 2226,
                header_size: 128,
                minor_version: 1,
                major_version: 3,
                header_block_size: 4096,
                chunk_count: 26,
                flags: HeaderFlags::DIRTY,
                checksum: crc32fast::hash(&raw[..120]),
                computed_checksum: crc32fast::hash(&raw[..120]),
            }
        );
        assert!(header.validate_checksum().is_ok());
        assert!(header.is_dirty());
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut raw = build_file_header(&FileHeaderOptions::default());
        raw[..8].copy_from_slice(b"ElfChnk\x00");

        assert_eq!(
            EvtxFileHeader::from_bytes(&raw).unwrap_err(),
            FormatError::InvalidMagic {
                magic: *b"ElfChnk\x00"
            }
        );
    }

    #[test]
    fn test_rejects_truncated_header() {
        let raw = build_file_header(&FileHeaderOptions::default());

        assert!(matches!(
            EvtxFileHeader::from_bytes(&raw[..100]).unwrap_err(),
            FormatError::Truncated { .. }
        ));
    }

    #[test]
    fn test_checksum_mismatch_is_not_fatal() {
        let mut raw = build_file_header(&FileHeaderOptions::default());
        raw[24] ^= 0xFF;

        let header = EvtxFileHeader::from_bytes(&raw).unwrap();
        assert!(matches!(
            header.validate_checksum(),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }
}

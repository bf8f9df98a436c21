//! Carving of records out of chunk slack space.
//!
//! When a chunk is dirty its free space offset cannot be trusted, so records may exist past it
//! (or past a corrupted record that stopped the sequential walk). The scan looks for the record
//! magic followed by a size that is consistent with the trailing size copy.

use log::trace;

use crate::evtx_record::{EVTX_RECORD_MAGIC, EVTX_RECORD_MIN_SIZE};
use crate::utils::bytes::read_u32_le;

/// Find the next plausible record at or after `from`.
///
/// Returns the chunk offset of the record and its size.
pub fn find_next_record(data: &[u8], from: usize) -> Option<(usize, u32)> {
    let mut pos = from;

    while let Some(hit) = data.get(pos..)?.windows(4).position(|w| w == EVTX_RECORD_MAGIC) {
        let offset = pos + hit;
        if let Some(size) = plausible_record_size(data, offset) {
            trace!("Carved record candidate at offset {} ({} bytes)", offset, size);
            return Some((offset, size));
        }
        pos = offset + 1;
    }

    None
}

fn plausible_record_size(data: &[u8], offset: usize) -> Option<u32> {
    let size = read_u32_le(data, offset + 4)?;
    if size < EVTX_RECORD_MIN_SIZE {
        return None;
    }
    let end = offset.checked_add(size as usize)?;
    if end > data.len() {
        return None;
    }
    (read_u32_le(data, end - 4)? == size).then_some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_at(buf: &mut [u8], offset: usize, size: u32) {
        buf[offset..offset + 4].copy_from_slice(EVTX_RECORD_MAGIC);
        buf[offset + 4..offset + 8].copy_from_slice(&size.to_le_bytes());
        let end = offset + size as usize;
        buf[end - 4..end].copy_from_slice(&size.to_le_bytes());
    }

    #[test]
    fn test_finds_record_with_consistent_sizes() {
        let mut buf = vec![0_u8; 256];
        record_at(&mut buf, 100, 40);

        assert_eq!(find_next_record(&buf, 0), Some((100, 40)));
        assert_eq!(find_next_record(&buf, 100), Some((100, 40)));
        assert_eq!(find_next_record(&buf, 101), None);
    }

    #[test]
    fn test_skips_magic_without_matching_trailer() {
        let mut buf = vec![0_u8; 256];
        buf[10..14].copy_from_slice(EVTX_RECORD_MAGIC);
        buf[14..18].copy_from_slice(&64_u32.to_le_bytes());
        record_at(&mut buf, 120, 32);

        assert_eq!(find_next_record(&buf, 0), Some((120, 32)));
    }

    #[test]
    fn test_rejects_records_running_off_the_buffer() {
        let mut buf = vec![0_u8; 64];
        buf[40..44].copy_from_slice(EVTX_RECORD_MAGIC);
        buf[44..48].copy_from_slice(&1024_u32.to_le_bytes());

        assert_eq!(find_next_record(&buf, 0), None);
        assert_eq!(find_next_record(&buf, 1000), None);
    }
}

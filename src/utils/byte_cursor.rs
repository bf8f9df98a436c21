use encoding::{DecoderTrap, EncodingRef};
use jiff::Timestamp;
use winstructs::guid::Guid;
use winstructs::security::Sid;

use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::bytes;
use crate::utils::utf16::decode_utf16le_lossy;
use crate::utils::windows::{filetime_to_timestamp, read_sid, read_systime};

/// A bounds-checked cursor over an immutable byte slice.
///
/// All reads are little-endian, advance the cursor on success, and leave it untouched on failure.
/// Offsets are always relative to the start of `buf`, which for BinXML is the start of the chunk,
/// so that positions can be compared against in-chunk offsets.
#[derive(Clone, Copy, Debug)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteCursor { buf, pos: 0 }
    }

    /// Create a cursor positioned at `pos`. `pos == buf.len()` is allowed (EOF).
    pub fn with_pos(buf: &'a [u8], pos: usize) -> DeserializationResult<Self> {
        let _ = bytes::slice_r(buf, pos, 0, "cursor.position")?;
        Ok(ByteCursor { buf, pos })
    }

    /// Create a cursor at `start` that cannot read at or past `end`.
    pub fn bounded(buf: &'a [u8], start: usize, end: usize) -> DeserializationResult<Self> {
        let limited = bytes::slice_r(buf, 0, end, "cursor.bound")?;
        Self::with_pos(limited, start)
    }

    #[inline]
    pub fn buf(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize, what: &'static str) -> DeserializationResult<()> {
        let _ = bytes::slice_r(self.buf, pos, 0, what)?;
        self.pos = pos;
        Ok(())
    }

    pub fn advance(&mut self, n: usize, what: &'static str) -> DeserializationResult<()> {
        let _ = self.take_bytes(n, what)?;
        Ok(())
    }

    #[inline]
    pub fn take_bytes(&mut self, len: usize, what: &'static str) -> DeserializationResult<&'a [u8]> {
        let out = bytes::slice_r(self.buf, self.pos, len, what)?;
        self.pos += len;
        Ok(out)
    }

    #[inline]
    pub fn array<const N: usize>(&mut self, what: &'static str) -> DeserializationResult<[u8; N]> {
        let v = bytes::read_array_r::<N>(self.buf, self.pos, what)?;
        self.pos += N;
        Ok(v)
    }

    #[inline]
    pub fn u8(&mut self) -> DeserializationResult<u8> {
        self.u8_named("u8")
    }

    #[inline]
    pub fn u8_named(&mut self, what: &'static str) -> DeserializationResult<u8> {
        Ok(self.array::<1>(what)?[0])
    }

    #[inline]
    pub fn u16(&mut self) -> DeserializationResult<u16> {
        self.u16_named("u16")
    }

    #[inline]
    pub fn u16_named(&mut self, what: &'static str) -> DeserializationResult<u16> {
        Ok(u16::from_le_bytes(self.array::<2>(what)?))
    }

    #[inline]
    pub fn u32(&mut self) -> DeserializationResult<u32> {
        self.u32_named("u32")
    }

    #[inline]
    pub fn u32_named(&mut self, what: &'static str) -> DeserializationResult<u32> {
        Ok(u32::from_le_bytes(self.array::<4>(what)?))
    }

    #[inline]
    pub fn u64(&mut self) -> DeserializationResult<u64> {
        self.u64_named("u64")
    }

    #[inline]
    pub fn u64_named(&mut self, what: &'static str) -> DeserializationResult<u64> {
        Ok(u64::from_le_bytes(self.array::<8>(what)?))
    }

    /// Read `char_count` UTF-16LE code units and decode them, stopping at the first NUL.
    ///
    /// Unpaired surrogates are replaced with U+FFFD.
    pub fn utf16_by_char_count(
        &mut self,
        char_count: usize,
        what: &'static str,
    ) -> DeserializationResult<String> {
        let byte_len = char_count
            .checked_mul(2)
            .ok_or_else(|| bytes::truncated(what, self.pos, usize::MAX, self.buf.len()))?;
        let raw = self.take_bytes(byte_len, what)?;
        Ok(decode_utf16le_lossy(raw))
    }

    /// Read a `u16` character count, then that many UTF-16LE code units.
    /// Optionally consumes a trailing NUL code unit.
    pub fn len_prefixed_utf16_string(
        &mut self,
        is_null_terminated: bool,
        what: &'static str,
    ) -> DeserializationResult<String> {
        let start = self.pos;
        let char_count = usize::from(self.u16_named(what)?);
        let s = self.utf16_by_char_count(char_count, what);
        let s = match s {
            Ok(s) => s,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        if is_null_terminated {
            if let Err(e) = self.u16_named(what) {
                self.pos = start;
                return Err(e);
            }
        }
        Ok(s)
    }

    /// Decode `len` bytes of a single-byte code page string, dropping NUL padding.
    pub fn ansi_string(
        &mut self,
        len: usize,
        codec: EncodingRef,
        what: &'static str,
    ) -> DeserializationResult<String> {
        let start = self.pos;
        let raw = self.take_bytes(len, what)?;
        let filtered: Vec<u8> = raw.iter().copied().filter(|&b| b != 0).collect();

        codec
            .decode(&filtered, DecoderTrap::Replace)
            .map_err(|message| DeserializationError::AnsiDecodeError {
                encoding: codec.name(),
                message: message.into_owned(),
                offset: start as u64,
            })
    }

    pub fn guid(&mut self) -> DeserializationResult<Guid> {
        let start = self.pos;
        let raw = self.array::<16>("guid")?;
        Guid::from_buffer(&raw).map_err(|_| {
            self.pos = start;
            DeserializationError::InvalidGuid {
                offset: start as u64,
            }
        })
    }

    /// Read a FILETIME (100ns intervals since 1601-01-01 UTC).
    pub fn filetime(&mut self, what: &'static str) -> DeserializationResult<Timestamp> {
        let start = self.pos;
        let raw = self.u64_named(what)?;
        filetime_to_timestamp(raw).map_err(|_| {
            self.pos = start;
            DeserializationError::InvalidDateTime {
                what,
                offset: start as u64,
            }
        })
    }

    pub fn systime(&mut self) -> DeserializationResult<Timestamp> {
        let start = self.pos;
        read_systime(self).inspect_err(|_| self.pos = start)
    }

    pub fn sid(&mut self) -> DeserializationResult<Sid> {
        let start = self.pos;
        read_sid(self).inspect_err(|_| self.pos = start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn test_primitive_reads_advance_position() {
        let buf = [0xAA, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let mut cursor = ByteCursor::new(&buf);

        assert_eq!(cursor.u8().unwrap(), 0xAA);
        assert_eq!(cursor.u16().unwrap(), 1);
        assert_eq!(cursor.u32().unwrap(), 2);
        assert_eq!(cursor.pos(), 7);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_out_of_bounds_read_leaves_position_unchanged() {
        let buf = [0_u8; 6];
        let mut cursor = ByteCursor::with_pos(&buf, 3).unwrap();

        let err = cursor.u32_named("record size").unwrap_err();
        assert_eq!(
            err,
            DeserializationError::Truncated {
                what: "record size",
                offset: 3,
                need: 4,
                have: 3,
            }
        );
        assert_eq!(cursor.pos(), 3);
        assert!(cursor.take_bytes(4, "bytes").is_err());
        assert_eq!(cursor.pos(), 3);
    }

    #[test]
    fn test_seek_allows_eof_but_not_past_it() {
        let buf = [0_u8; 4];
        let mut cursor = ByteCursor::new(&buf);

        cursor.seek(4, "eof").unwrap();
        assert_eq!(cursor.remaining(), 0);
        assert!(cursor.seek(5, "past eof").is_err());
        assert_eq!(cursor.pos(), 4);
    }

    #[test]
    fn test_bounded_cursor_cannot_read_past_end() {
        let buf = [1_u8, 2, 3, 4, 5, 6, 7, 8];
        let mut cursor = ByteCursor::bounded(&buf, 2, 4).unwrap();

        assert_eq!(cursor.u16().unwrap(), 0x0403);
        assert!(cursor.u8().is_err());
    }

    #[test]
    fn test_utf16_stops_at_nul() {
        let mut buf = utf16("Event");
        buf.extend_from_slice(&[0, 0, b'X', 0]);
        let mut cursor = ByteCursor::new(&buf);

        assert_eq!(cursor.utf16_by_char_count(7, "name").unwrap(), "Event");
        assert_eq!(cursor.pos(), 14);
    }

    #[test]
    fn test_len_prefixed_utf16_string() {
        let mut buf = vec![4, 0];
        buf.extend(utf16("Data"));
        buf.extend_from_slice(&[0, 0]);
        let mut cursor = ByteCursor::new(&buf);

        assert_eq!(
            cursor.len_prefixed_utf16_string(true, "name").unwrap(),
            "Data"
        );
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_filetime() {
        // 2019-03-24T16:04:49.3868608Z
        let buf = 0x01D4_E25B_4EE1_2E40_u64.to_le_bytes();
        let mut cursor = ByteCursor::new(&buf);

        let ts = cursor.filetime("timestamp").unwrap();
        assert_eq!(ts.as_second(), 1_553_443_489);
        assert_eq!(ts.subsec_nanosecond(), 386_860_800);
    }

    #[test]
    fn test_ansi_string_drops_padding() {
        let buf = *b"caf\xe9\x00\x00";
        let mut cursor = ByteCursor::new(&buf);

        let s = cursor
            .ansi_string(6, encoding::all::WINDOWS_1252, "ansi")
            .unwrap();
        assert_eq!(s, "café");
    }
}

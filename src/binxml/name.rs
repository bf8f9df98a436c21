use log::trace;

use crate::ChunkOffset;
use crate::err::DeserializationResult as Result;
use crate::string_cache::StringCache;
use crate::utils::ByteCursor;

/// An element or attribute name as stored in the chunk.
///
/// Layout: next string offset (u32), hash (u16), character count (u16), UTF-16LE characters,
/// NUL terminator (u16).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BinXmlName {
    pub(crate) name: String,
    /// Bytes occupied by the structure, including the link and the terminator.
    pub(crate) data_size: u32,
}

impl BinXmlName {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Read the name structure located at the cursor.
    pub(crate) fn from_cursor(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let start = cursor.pos();
        let _next_string = cursor.u32_named("name next offset")?;
        let _hash = cursor.u16_named("name hash")?;
        let name = cursor
            .len_prefixed_utf16_string(true, "name")
            .inspect_err(|_| {
                let _ = cursor.seek(start, "name");
            })?;

        Ok(BinXmlName {
            data_size: (cursor.pos() - start) as u32,
            name,
        })
    }
}

/// Read a name reference (a `u32` chunk offset) and resolve it.
///
/// When the offset points right after itself the name structure is stored inline and the
/// cursor is advanced past it.
pub(crate) fn read_name_ref(cursor: &mut ByteCursor<'_>, strings: &mut StringCache) -> Result<String> {
    let name_offset: ChunkOffset = cursor.u32_named("name offset")?;
    let inline = name_offset as usize == cursor.pos();

    let name = strings.get_or_read(cursor.buf(), name_offset)?;
    trace!(
        "\tName at {} ({}): {}",
        name_offset,
        if inline { "inline" } else { "cached" },
        name.as_str()
    );

    if inline {
        let size = name.data_size as usize;
        let name = name.name.clone();
        cursor.advance(size, "inline name")?;
        return Ok(name);
    }
    Ok(name.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn name_struct(s: &str) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 0, 0xAB, 0xCD];
        out.extend_from_slice(&(s.encode_utf16().count() as u16).to_le_bytes());
        out.extend(s.encode_utf16().flat_map(u16::to_le_bytes));
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn test_reads_inline_name_and_skips_it() {
        let mut buf = 4_u32.to_le_bytes().to_vec();
        buf.extend(name_struct("Event"));
        buf.push(0x02);

        let mut strings = StringCache::new();
        let mut cursor = ByteCursor::new(&buf);
        let name = read_name_ref(&mut cursor, &mut strings).unwrap();

        assert_eq!(name, "Event");
        assert_eq!(cursor.pos(), buf.len() - 1);
        assert_eq!(strings.len(), 1);
    }

    #[test]
    fn test_reads_name_by_reference_without_moving() {
        let mut buf = name_struct("System");
        let reference_at = buf.len();
        buf.extend_from_slice(&0_u32.to_le_bytes());

        let mut strings = StringCache::new();
        let mut cursor = ByteCursor::with_pos(&buf, reference_at).unwrap();
        let name = read_name_ref(&mut cursor, &mut strings).unwrap();

        assert_eq!(name, "System");
        assert_eq!(cursor.pos(), buf.len());
    }

    #[test]
    fn test_name_out_of_bounds_is_an_error() {
        let buf = 1000_u32.to_le_bytes();
        let mut strings = StringCache::new();
        let mut cursor = ByteCursor::new(&buf);

        assert!(read_name_ref(&mut cursor, &mut strings).is_err());
    }
}

/// Decode UTF-16LE bytes up to the first NUL code unit, replacing unpaired surrogates.
///
/// A trailing odd byte is ignored.
pub(crate) fn decode_utf16le_lossy(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0);

    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf16le_lossy() {
        let bytes: Vec<u8> = "Sys\u{1F600}"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        assert_eq!(decode_utf16le_lossy(&bytes), "Sys\u{1F600}");

        // Lone high surrogate followed by NUL and garbage.
        let bytes = [0x3D, 0xD8, 0x41, 0x00, 0x00, 0x00, 0x42, 0x00];
        assert_eq!(decode_utf16le_lossy(&bytes), "\u{FFFD}A");
    }
}

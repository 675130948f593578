//! Single-byte character set of the display

/// Transliterates text to the device's ISO 8859-1 character set.
/// Characters outside it are dropped.
pub fn to_device_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_kept() {
        assert_eq!(to_device_bytes("Caf\u{e9}"), vec![b'C', b'a', b'f', 0xE9]);
    }

    #[test]
    fn test_unencodable_dropped() {
        assert_eq!(to_device_bytes("\u{20ac}5 \u{1f600}ok"), b"5 ok".to_vec());
    }
}

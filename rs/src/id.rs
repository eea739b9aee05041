//! Record id <-> file name encoding
//!
//! Ids are free-form (resource keys look like `src/app.ts`). Bytes outside
//! `[A-Za-z0-9._-]` are written as `%XX`; a leading `.` is escaped too so no
//! record file is ever a dotfile.

/// Encode a record id into a file stem
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' || (byte == b'.' && i > 0);
        if plain {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Decode a file stem back into a record id
///
/// Returns None for stems that were not produced by [`encode_id`].
pub fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_ids_unchanged() {
        assert_eq!(encode_id("0199a3c2-7d1e"), "0199a3c2-7d1e");
        assert_eq!(encode_id("app.ts"), "app.ts");
    }

    #[test]
    fn test_path_separators_escaped() {
        assert_eq!(encode_id("src/app.ts"), "src%2Fapp.ts");
        assert_eq!(decode_id("src%2Fapp.ts").as_deref(), Some("src/app.ts"));
    }

    #[test]
    fn test_leading_dot_escaped() {
        assert_eq!(encode_id(".env"), "%2Eenv");
        assert_eq!(decode_id("%2Eenv").as_deref(), Some(".env"));
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert!(decode_id("abc%2").is_none());
        assert!(decode_id("abc%zz").is_none());
    }

    proptest! {
        #[test]
        fn prop_encoding_is_reversible(id in "\\PC{0,40}") {
            let encoded = encode_id(&id);
            prop_assert!(!encoded.starts_with('.'));
            prop_assert!(!encoded.contains('/'));
            prop_assert_eq!(decode_id(&encoded), Some(id));
        }
    }
}

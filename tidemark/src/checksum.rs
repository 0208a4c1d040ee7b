//! Migration body checksums.
//!
//! The checksum detects drift between a script as it was applied and the same
//! script as it resolves today. The digest must stay identical across
//! platforms and releases; changing the algorithm requires a metadata layout
//! upgrade so stored checksums can be rewritten.

use sha2::{Digest, Sha256};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Compute the checksum of a migration body.
///
/// Normalization is fixed: a leading UTF-8 byte-order-mark and any trailing
/// newline bytes (`\n`, `\r`) are stripped before hashing, so editors that
/// add or remove a final newline do not invalidate applied migrations. The
/// SHA-256 digest is folded to the stored `i32` width by taking its first
/// four bytes big-endian.
pub fn compute(body: &[u8]) -> i32 {
    let mut normalized = body;
    if normalized.starts_with(UTF8_BOM) {
        normalized = &normalized[UTF8_BOM.len()..];
    }
    while let Some((&last, rest)) = normalized.split_last() {
        if last == b'\n' || last == b'\r' {
            normalized = rest;
        } else {
            break;
        }
    }

    let digest = Sha256::digest(normalized);
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_identical_input() {
        let body = b"db.users.createIndex({ name: 1 });";
        assert_eq!(compute(body), compute(body));
    }

    #[test]
    fn differs_for_different_bodies() {
        assert_ne!(compute(b"CREATE TABLE a (id INTEGER);"), compute(b"CREATE TABLE b (id INTEGER);"));
    }

    #[test]
    fn trailing_newlines_are_ignored() {
        let base = compute(b"SELECT 1;");
        assert_eq!(compute(b"SELECT 1;\n"), base);
        assert_eq!(compute(b"SELECT 1;\r\n"), base);
        assert_eq!(compute(b"SELECT 1;\n\n\n"), base);
        // an interior newline is significant
        assert_ne!(compute(b"SELECT\n1;"), compute(b"SELECT 1;"));
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let with_bom = [0xEF, 0xBB, 0xBF, b'x'];
        assert_eq!(compute(&with_bom), compute(b"x"));
    }

    #[test]
    fn empty_input_has_a_stable_checksum() {
        assert_eq!(compute(b""), compute(b"\n"));
    }
}

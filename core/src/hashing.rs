//! SHA-256 helpers.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 digest of `data`.
///
/// Used for message hashes reported to the triage service and for the
/// `uacHash` carried by outbound UAC events. Stateless; safe to call from any
/// number of tasks at once.
#[must_use]
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn same_input_same_hash() {
        let body = br#"{"event":{"type":"RESPONSE_RECEIVED"}}"#;
        assert_eq!(sha256_hex(body), sha256_hex(body));
        assert_ne!(sha256_hex(body), sha256_hex(b"{}"));
    }
}

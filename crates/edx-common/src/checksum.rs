//! Checksum utilities for fetched blobs and stored objects

use crate::error::{EdxError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Hex-encoded SHA-256 of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut buffer = [0u8; 8192];
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
            Ok(hex::encode(hasher.finalize()))
        },
        ChecksumAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
            Ok(hex::encode(hasher.finalize()))
        },
    }
}

/// Verify that `data` hashes to `expected` (SHA-256)
///
/// Used when re-reading an object whose hash was recorded at commit time.
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(EdxError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Short stable digest, used to build object keys from identities
pub fn short_digest(value: &str) -> String {
    let mut full = sha256_hex(value.as_bytes());
    full.truncate(16);
    full
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_compute_checksum_sha512() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha512).unwrap();
        assert_eq!(
            checksum,
            "309ecc489c12d6eb4cc40f50c902f2b4d0ed77ee511a7c7a9bcd3ca86d4cd86f989dd35bc5ff499670da34255b45b0cfd830e81f605dcf7dc5542e93ae9cd76f"
        );
    }

    #[test]
    fn test_streaming_matches_buffer() {
        let data = vec![7u8; 20_000];
        let mut cursor = Cursor::new(data.clone());
        let streamed = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(streamed, sha256_hex(&data));
    }

    #[test]
    fn test_verify_sha256() {
        let digest = sha256_hex(b"abc");
        assert!(verify_sha256(b"abc", &digest.to_uppercase()).is_ok());
        assert!(matches!(
            verify_sha256(b"abd", &digest),
            Err(EdxError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_short_digest_is_stable() {
        assert_eq!(short_digest("NRLDC|2025-08-25"), short_digest("NRLDC|2025-08-25"));
        assert_eq!(short_digest("x").len(), 16);
    }
}

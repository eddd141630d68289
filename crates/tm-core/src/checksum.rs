//! SHA-256 checksum utility for migration drift detection.

use sha2::{Digest, Sha256};

/// Compute SHA256 checksum of a string
pub fn compute_checksum(s: &str) -> String {
    compute_checksum_bytes(s.as_bytes())
}

/// Compute SHA256 checksum of raw file content
pub fn compute_checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    format!("{:x}", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            compute_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum_str_matches_bytes() {
        let sql = "CREATE TABLE users (id INTEGER);";
        assert_eq!(compute_checksum(sql), compute_checksum_bytes(sql.as_bytes()));
    }

    #[test]
    fn test_checksum_detects_whitespace_change() {
        assert_ne!(
            compute_checksum("SELECT 1;"),
            compute_checksum("SELECT 1; ")
        );
    }
}

// kiln-aio/src/checksum.rs
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Hex-encoded SHA256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let bytes_copied = io::copy(&mut reader, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 for {}: {} ({} bytes read)",
        path.display(),
        actual,
        bytes_copied
    );
    Ok(actual)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verifies the SHA256 of `path`. A mismatch is an `IntegrityError` for
/// `package`; callers must not retry it.
pub fn verify_checksum(package: &str, path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    debug!("Expected SHA256:   {}", expected);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(KilnError::IntegrityError {
            package: package.to_string(),
            location: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

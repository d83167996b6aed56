//! Content hashing for source-row change detection

use sha2::{Digest, Sha256};

/// SHA-256 (hex) of a source row's content.
///
/// Leading/trailing whitespace is ignored so a re-export that only pads the
/// cell does not register as an edit.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

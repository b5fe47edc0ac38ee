//! Pointer representation for large and binary blobs.
//!
//! Such files are diffed as small text pointers (git-lfs layout) instead of
//! their content, so hunks stay readable and hashing stays cheap.

use git2::{Oid, Repository};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub const POINTER_VERSION: &str = "https://git-lfs.github.com/spec/v1";

/// Pointer text for `content`
pub fn pointer_text(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    format!(
        "version {POINTER_VERSION}\noid sha256:{:x}\nsize {}\n",
        digest,
        content.len()
    )
}

/// Pointer bytes for a blob; the zero id (absent side) is empty.
pub(crate) fn blob_pointer(repo: &Repository, oid: Oid) -> Result<Vec<u8>> {
    if oid.is_zero() {
        return Ok(Vec::new());
    }
    let blob = repo.find_blob(oid)?;
    Ok(pointer_text(blob.content()).into_bytes())
}

/// Size of a blob in bytes, zero for the absent side.
pub(crate) fn blob_size(repo: &Repository, oid: Oid) -> Result<u64> {
    if oid.is_zero() {
        return Ok(0);
    }
    Ok(repo.find_blob(oid)?.size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_names_digest_and_size() {
        let text = pointer_text(b"hello\n");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("version {POINTER_VERSION}"));
        assert_eq!(
            lines[1],
            "oid sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        assert_eq!(lines[2], "size 6");
    }
}

//! Validates server- and push-channel-supplied relative paths before they
//! are joined to the sync root (sec 3: "parent-directory components
//! forbidden, absolute paths forbidden"; sec 8 property 9: path resolution
//! never yields a path outside the sync root).

use crate::error::SyncError;

/// Rejects `..` components, absolute paths (leading `/` or `\`), and
/// drive-letter prefixes (`C:\`), and collapses away empty/`.` components
/// left behind by leading, trailing, or repeated separators.
///
/// Returns the normalized path joined with `/`, safe to hand to
/// `Path::join` against the sync root.
pub fn validate_relative_path(raw: &str) -> Result<String, SyncError> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(SyncError::Validation(format!("absolute path rejected: {raw}")));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(SyncError::Validation(format!("drive-letter path rejected: {raw}")));
    }

    let mut components: Vec<&str> = Vec::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(SyncError::Validation(format!("parent-directory component rejected: {raw}"))),
            other => components.push(other),
        }
    }

    if components.is_empty() {
        return Err(SyncError::Validation(format!("empty path rejected: {raw}")));
    }

    Ok(components.join("/"))
}

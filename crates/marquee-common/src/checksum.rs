//! SHA-256 helpers for downloaded source files.
//!
//! A verified download is accompanied by a sidecar file (`<name>.sha256`)
//! written in `sha256sum` format. A later run that finds the sidecar and a
//! matching digest can reuse the cached file instead of downloading again.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const SIDECAR_EXTENSION: &str = "sha256";
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex-encoded SHA-256 digest of any readable source
pub fn compute_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex-encoded SHA-256 digest of a file
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = fs::File::open(path)?;
    compute_sha256(&mut file)
}

/// Path of the sidecar that stores the digest for `path`
pub fn sidecar_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    path.with_file_name(name)
}

/// Hash `path` and record the digest in its sidecar. Returns the digest.
pub fn write_sidecar(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let digest = sha256_file(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(sidecar_path(path), format!("{}  {}\n", digest, file_name))?;
    Ok(digest)
}

/// Read the digest recorded for `path`, if a sidecar exists
pub fn read_sidecar(path: impl AsRef<Path>) -> Result<Option<String>> {
    let sidecar = sidecar_path(path);
    let contents = match fs::read_to_string(&sidecar) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let digest = contents.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CommonError::MalformedSidecar {
            path: sidecar.display().to_string(),
            reason: format!("expected 64 hex characters, found {:?}", digest),
        });
    }

    Ok(Some(digest.to_ascii_lowercase()))
}

/// True when `path` exists, has a sidecar, and hashes to the recorded digest.
///
/// A malformed sidecar counts as a mismatch rather than an error so the
/// caller simply downloads again.
pub fn sidecar_matches(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    if !path.is_file() {
        return Ok(false);
    }

    let expected = match read_sidecar(path) {
        Ok(Some(digest)) => digest,
        Ok(None) | Err(CommonError::MalformedSidecar { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };

    Ok(sha256_file(path)? == expected)
}

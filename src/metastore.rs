//! Checksummed metadata persistence.
//!
//! Every persisted entity (template, stream, consumer) keeps a `meta.inf`
//! JSON file next to a `meta.sum` companion. The sum is the lowercase hex
//! encoding of a 64-bit keyed hash over the metafile bytes; the key is the
//! SHA-256 digest of the directory path that owns the metadata. A metafile
//! whose sum does not verify is ignored during recovery, never trusted.

use crate::error::{JetStreamError, Result};
use crate::template::StreamTemplateConfig;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata file holding the entity's JSON config.
pub const META_FILE: &str = "meta.inf";
/// Companion checksum file for [`META_FILE`].
pub const META_SUM: &str = "meta.sum";

/// Per-account directory holding template metadata.
pub const TEMPLATES_DIR: &str = "templates";
/// Per-account directory holding stream state.
pub const STREAMS_DIR: &str = "streams";
/// Per-stream directory holding consumer state.
pub const CONSUMERS_DIR: &str = "consumers";
/// Per-stream directory holding the message log.
pub const MSGS_DIR: &str = "msgs";
/// Durable consumer cursor file.
pub const CONSUMER_STATE_FILE: &str = "state.json";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("missing metafile {0:?}")]
    MissingMeta(PathBuf),
    #[error("missing checksum for {0:?}")]
    MissingSum(PathBuf),
    #[error("checksums do not match {found:?} vs {computed:?}")]
    ChecksumMismatch { found: String, computed: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Derives the checksum key for metadata owned by `dir`.
pub fn checksum_key(dir: &Path) -> [u8; 32] {
    Sha256::digest(dir.to_string_lossy().as_bytes()).into()
}

/// 64-bit keyed hash of `payload`, lowercase hex (16 chars).
pub fn keyed_checksum(key: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    hex::encode(&digest[..8])
}

/// Writes `meta.inf` + `meta.sum` under `dir` with atomic replace
/// semantics.
pub fn write_meta(dir: &Path, key: &[u8], payload: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    atomic_write(&dir.join(META_FILE), payload)?;
    let sum = keyed_checksum(key, payload);
    atomic_write(&dir.join(META_SUM), sum.as_bytes())
}

/// Reads and verifies `meta.inf` under `dir`, returning its bytes only when
/// the companion checksum matches.
pub fn read_verified_meta(dir: &Path, key: &[u8]) -> std::result::Result<Vec<u8>, MetaError> {
    let metafile = dir.join(META_FILE);
    let metasum = dir.join(META_SUM);
    if !metafile.exists() {
        return Err(MetaError::MissingMeta(metafile));
    }
    let payload = fs::read(&metafile)?;
    if !metasum.exists() {
        return Err(MetaError::MissingSum(metasum));
    }
    let found = fs::read_to_string(&metasum)?;
    let computed = keyed_checksum(key, &payload);
    if found != computed {
        return Err(MetaError::ChecksumMismatch { found, computed });
    }
    Ok(payload)
}

/// Write-temp-then-rename, with the temp file synced before the swap.
pub fn atomic_write(path: &Path, payload: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("meta");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    let mut out = fs::File::create(&tmp)?;
    out.write_all(payload)?;
    out.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Persisted key/value home for an account's templates.
pub trait TemplateStore: Send + Sync {
    fn store(&self, config: &StreamTemplateConfig) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// File-backed template store rooted at `<account dir>/templates`. Used when
/// the template prototype selects file storage.
pub struct TemplateFileStore {
    dir: PathBuf,
}

impl TemplateFileStore {
    pub fn new(account_dir: &Path) -> Self {
        Self {
            dir: account_dir.join(TEMPLATES_DIR),
        }
    }
}

impl TemplateStore for TemplateFileStore {
    fn store(&self, config: &StreamTemplateConfig) -> Result<()> {
        // The embedded prototype name is a placeholder at runtime; persist it
        // blank so recovery can hand the config straight back to
        // add_stream_template.
        let mut persisted = config.clone();
        persisted.config.name = String::new();
        let payload = serde_json::to_vec(&persisted)?;
        let key = checksum_key(&self.dir);
        write_meta(&self.dir.join(&config.name), &key, &payload).map_err(JetStreamError::Io)
    }

    fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(JetStreamError::Io(err)),
        }
    }
}

/// In-process template store; no durability by design.
pub struct TemplateMemStore;

impl TemplateStore for TemplateMemStore {
    fn store(&self, _config: &StreamTemplateConfig) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn checksum_depends_on_key_and_payload() {
        let key_a = checksum_key(Path::new("/state/a"));
        let key_b = checksum_key(Path::new("/state/b"));
        let sum = keyed_checksum(&key_a, b"payload");
        assert_eq!(sum.len(), 16);
        assert_eq!(sum, keyed_checksum(&key_a, b"payload"));
        assert_ne!(sum, keyed_checksum(&key_b, b"payload"));
        assert_ne!(sum, keyed_checksum(&key_a, b"payloae"));
    }

    #[test]
    fn meta_round_trip() {
        let dir = tempdir().unwrap();
        let entity = dir.path().join("orders");
        let key = checksum_key(dir.path());
        write_meta(&entity, &key, b"{\"name\":\"orders\"}").unwrap();
        let payload = read_verified_meta(&entity, &key).unwrap();
        assert_eq!(payload, b"{\"name\":\"orders\"}");
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let dir = tempdir().unwrap();
        let entity = dir.path().join("orders");
        let key = checksum_key(dir.path());
        write_meta(&entity, &key, b"{\"name\":\"orders\"}").unwrap();

        let metafile = entity.join(META_FILE);
        let mut bytes = fs::read(&metafile).unwrap();
        bytes[2] ^= 0x01;
        fs::write(&metafile, &bytes).unwrap();

        assert!(matches!(
            read_verified_meta(&entity, &key),
            Err(MetaError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_sum_is_reported() {
        let dir = tempdir().unwrap();
        let entity = dir.path().join("orders");
        let key = checksum_key(dir.path());
        write_meta(&entity, &key, b"x").unwrap();
        fs::remove_file(entity.join(META_SUM)).unwrap();
        assert!(matches!(
            read_verified_meta(&entity, &key),
            Err(MetaError::MissingSum(_))
        ));
    }
}

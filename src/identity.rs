//! Node identity key store
//!
//! One identity key per process, persisted at `<data_dir>/private.key` as
//! hex with 0600 permissions and generated on first start. The peer id is
//! derived from the key; the codec uses the raw key material for signing.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Key length in bytes
const KEY_LEN: usize = 32;
/// Hex characters of the derived peer id
const PEER_ID_HEX_LEN: usize = 40;

/// Identity key errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key file i/o failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file at {} is not a valid {KEY_LEN}-byte hex key", path.display())]
    InvalidKey { path: PathBuf },
}

/// The process-wide signing identity
#[derive(Debug, Clone)]
pub struct IdentityKey {
    key: Vec<u8>,
    peer_id: String,
}

impl IdentityKey {
    /// Loads the key from `<data_dir>/private.key`, generating it if absent
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, IdentityError> {
        let path = data_dir.join("private.key");
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| IdentityError::Io {
                path: path.clone(),
                source,
            })?;
            let key = hex::decode(content.trim())
                .map_err(|_| IdentityError::InvalidKey { path: path.clone() })?;
            if key.len() != KEY_LEN {
                return Err(IdentityError::InvalidKey { path });
            }
            return Ok(Self::from_key(key));
        }

        fs::create_dir_all(data_dir).map_err(|source| IdentityError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let mut key = vec![0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        write_key_file(&path, &hex::encode(&key))?;
        info!(path = %path.display(), "generated new identity key");
        Ok(Self::from_key(key))
    }

    /// Builds an identity from raw key material; used by tests
    #[must_use]
    pub fn from_key(key: Vec<u8>) -> Self {
        let digest = Sha256::digest(&key);
        let peer_id = hex::encode(digest)[..PEER_ID_HEX_LEN].to_string();
        Self { key, peer_id }
    }

    /// The derived peer id
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Raw key material for the codec's signing scheme
    #[must_use]
    pub fn signing_key(&self) -> Vec<u8> {
        self.key.clone()
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, hex_key: &str) -> Result<(), IdentityError> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(hex_key.as_bytes())
        .map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, hex_key: &str) -> Result<(), IdentityError> {
    fs::write(path, hex_key).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityKey::load_or_generate(dir.path()).unwrap();
        let second = IdentityKey::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.signing_key(), second.signing_key());
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.peer_id().len(), PEER_ID_HEX_LEN);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        IdentityKey::load_or_generate(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("private.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rejects_corrupt_key_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("private.key"), "not hex at all").unwrap();
        assert!(matches!(
            IdentityKey::load_or_generate(dir.path()),
            Err(IdentityError::InvalidKey { .. })
        ));
    }
}

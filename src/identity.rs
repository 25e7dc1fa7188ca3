//! Persistent device identity
//!
//! A device is identified by a long-lived x25519 key pair. The private key is
//! kept as exactly 32 raw bytes in `<storage>/identity.key`; the public key is
//! derived from it on load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

/// File name of the private key inside the storage directory
pub const IDENTITY_FILE: &str = "identity.key";

/// Size of public and private keys
pub const KEY_SIZE: usize = 32;

/// Identity storage errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity not initialized")]
    Uninitialized,

    #[error("Identity already initialized from {0:?}")]
    AlreadyInitialized(PathBuf),

    #[error("Identity storage error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt identity key {path:?}: expected {KEY_SIZE} bytes, found {len}")]
    Corrupt { path: PathBuf, len: usize },

    #[error("Buffer too small: need {KEY_SIZE} bytes, got {0}")]
    BufferTooSmall(usize),
}

struct LoadedIdentity {
    storage: PathBuf,
    secret: StaticSecret,
    public: PublicKey,
}

/// Process-wide identity holder
#[derive(Default)]
pub struct IdentityStore {
    inner: RwLock<Option<LoadedIdentity>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load or create the identity under `storage_path` and return its public key
    ///
    /// Calling again with the same path returns the loaded key without touching
    /// disk. A different path is refused once an identity is loaded.
    pub fn init(&self, storage_path: &Path) -> Result<[u8; KEY_SIZE], IdentityError> {
        let mut guard = self.inner.write();

        if let Some(loaded) = guard.as_ref() {
            if loaded.storage == storage_path {
                return Ok(loaded.public.to_bytes());
            }
            return Err(IdentityError::AlreadyInitialized(loaded.storage.clone()));
        }

        let key_path = storage_path.join(IDENTITY_FILE);
        let secret = if key_path.exists() {
            let secret = read_key(&key_path)?;
            debug!("Loaded identity from {:?}", key_path);
            secret
        } else {
            let secret = StaticSecret::random_from_rng(OsRng);
            write_key(storage_path, &key_path, &secret)?;
            info!("Generated new identity at {:?}", key_path);
            secret
        };

        let public = PublicKey::from(&secret);
        *guard = Some(LoadedIdentity {
            storage: storage_path.to_path_buf(),
            secret,
            public,
        });
        Ok(public.to_bytes())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn public_key(&self) -> Result<[u8; KEY_SIZE], IdentityError> {
        self.inner
            .read()
            .as_ref()
            .map(|loaded| loaded.public.to_bytes())
            .ok_or(IdentityError::Uninitialized)
    }

    /// Copy the public key into `out`, which must hold at least 32 bytes
    pub fn copy_public_key(&self, out: &mut [u8]) -> Result<(), IdentityError> {
        if out.len() < KEY_SIZE {
            return Err(IdentityError::BufferTooSmall(out.len()));
        }
        let key = self.public_key()?;
        out[..KEY_SIZE].copy_from_slice(&key);
        Ok(())
    }

    /// Secret handed to the session handshake
    pub(crate) fn secret(&self) -> Result<StaticSecret, IdentityError> {
        self.inner
            .read()
            .as_ref()
            .map(|loaded| loaded.secret.clone())
            .ok_or(IdentityError::Uninitialized)
    }
}

fn read_key(path: &Path) -> Result<StaticSecret, IdentityError> {
    let bytes = fs::read(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: [u8; KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::Corrupt {
            path: path.to_path_buf(),
            len: bytes.len(),
        })?;
    Ok(StaticSecret::from(raw))
}

fn write_key(dir: &Path, path: &Path, secret: &StaticSecret) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_err)?;

    // Write to a temp file and rename so a crash never leaves a partial key
    let tmp_path = dir.join(format!("{}.tmp", IDENTITY_FILE));
    let mut file = open_private(&tmp_path).map_err(io_err)?;
    file.write_all(secret.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(io_err)
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

//! Trust-on-first-use identity pinning.
//!
//! A client records the public identity a server presents the first time it
//! talks to a host, keyed by the client's own seed namespace. Later contacts
//! must present the same identity; anything else is treated as an identity
//! substitution.
//!
//! Records are write-once: [`PinStore::put_if_absent`] never overwrites, and
//! nothing in this crate deletes a record.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

const MAX_HOST_FILE_BYTES: usize = 128;
const RECORD_EXTENSION: &str = "bin";
const RECORD_LEN: usize = 8;
const STAGED_SUFFIX: &str = "part";

static STAGED_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum PinStoreError {
    #[error("pin store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt pin record: {0}")]
    Corrupt(PathBuf),

    #[error("host label cannot be pinned: {0:?}")]
    InvalidHost(String),

    #[error("pin store lock poisoned")]
    Poisoned,
}

impl PinStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Key-value store of pinned identities.
pub trait PinStore: Send + Sync {
    fn get(&self, namespace: &str, host: &str) -> Result<Option<u64>, PinStoreError>;

    /// Store `identity` unless a record already exists. Returns the value
    /// that is pinned after the call, which is the existing one if there
    /// was one.
    fn put_if_absent(&self, namespace: &str, host: &str, identity: u64)
        -> Result<u64, PinStoreError>;
}

/// Result of checking a presented identity against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    /// No record existed; the presented identity is now pinned.
    FirstUse,
    Match,
    Mismatch { pinned: u64, presented: u64 },
}

impl PinStatus {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, PinStatus::Mismatch { .. })
    }
}

/// Compare `presented` with the pinned identity for `(namespace, host)`,
/// pinning it if the pair has not been seen before.
pub fn check_pin(
    store: &dyn PinStore,
    namespace: &str,
    host: &str,
    presented: u64,
) -> Result<PinStatus, PinStoreError> {
    let status = match store.get(namespace, host)? {
        Some(pinned) if pinned == presented => PinStatus::Match,
        Some(pinned) => PinStatus::Mismatch { pinned, presented },
        None => {
            // Another writer may have pinned the host between get and put.
            let pinned = store.put_if_absent(namespace, host, presented)?;
            if pinned == presented {
                debug!(host, identity = presented, "pinned new host identity");
                PinStatus::FirstUse
            } else {
                PinStatus::Mismatch { pinned, presented }
            }
        }
    };

    if let PinStatus::Mismatch { pinned, presented } = status {
        warn!(
            host,
            pinned, presented, "presented identity does not match pinned identity"
        );
    }
    Ok(status)
}

/// Namespace for an operator seed: the first 32 hex digits of its SHA-256.
///
/// The same seed maps to the same namespace across runs; the seed itself
/// never reaches the filesystem.
pub fn namespace_for_seed(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut ns = hex::encode(digest);
    ns.truncate(32);
    ns
}

/// Filesystem-backed store: `<root>/<namespace>/<host>.bin`, each file
/// holding the 8-byte little-endian identity.
#[derive(Debug, Clone)]
pub struct FsPinStore {
    root: PathBuf,
}

impl FsPinStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-user data directory: `$HOME/.local/share/budp` or
    /// `%APPDATA%\budp`.
    pub fn default_root() -> Option<PathBuf> {
        if cfg!(windows) {
            std::env::var_os("APPDATA").map(|dir| PathBuf::from(dir).join("budp"))
        } else {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".local").join("share").join("budp"))
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, namespace: &str, host: &str) -> Result<PathBuf, PinStoreError> {
        let ns = sanitize_component(namespace)
            .ok_or_else(|| PinStoreError::InvalidHost(namespace.to_string()))?;
        let file = host_file_stem(host).ok_or_else(|| PinStoreError::InvalidHost(host.into()))?;
        Ok(self
            .root
            .join(ns)
            .join(format!("{file}.{RECORD_EXTENSION}")))
    }

    fn ensure_dir(dir: &Path) -> Result<(), PinStoreError> {
        fs::create_dir_all(dir).map_err(|e| PinStoreError::io(dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| PinStoreError::io(dir, e))?;
        }
        Ok(())
    }

    fn read_record(path: &Path) -> Result<Option<u64>, PinStoreError> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PinStoreError::io(path, e)),
        };
        let mut buf = Vec::with_capacity(RECORD_LEN);
        file.read_to_end(&mut buf)
            .map_err(|e| PinStoreError::io(path, e))?;
        // A zero-length record is a write that never completed.
        if buf.is_empty() {
            return Ok(None);
        }
        let bytes: [u8; RECORD_LEN] = buf
            .as_slice()
            .try_into()
            .map_err(|_| PinStoreError::Corrupt(path.to_path_buf()))?;
        Ok(Some(u64::from_le_bytes(bytes)))
    }

    /// Write the full record under a unique name next to its final path.
    fn stage_record(path: &Path, identity: u64) -> Result<PathBuf, PinStoreError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let staged = path.with_extension(format!(
            "{RECORD_EXTENSION}.{}-{nanos}-{}.{STAGED_SUFFIX}",
            std::process::id(),
            STAGED_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .map_err(|e| PinStoreError::io(&staged, e))?;
        let written = file
            .write_all(&identity.to_le_bytes())
            .and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written {
            fs::remove_file(&staged).ok();
            return Err(PinStoreError::io(&staged, e));
        }
        Ok(staged)
    }

    /// Link the staged record into place. The link fails if a record
    /// already exists, so readers only ever see complete records and the
    /// first writer wins.
    fn publish(staged: &Path, path: &Path, identity: u64) -> Result<u64, PinStoreError> {
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => return Ok(identity),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(PinStoreError::io(path, e)),
            }
            if let Some(pinned) = Self::read_record(path)? {
                return Ok(pinned);
            }
            warn!(path = %path.display(), "replacing empty pin record");
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(PinStoreError::io(path, e)),
            }
        }
        Err(PinStoreError::Corrupt(path.to_path_buf()))
    }
}

impl PinStore for FsPinStore {
    fn get(&self, namespace: &str, host: &str) -> Result<Option<u64>, PinStoreError> {
        let path = self.record_path(namespace, host)?;
        Self::read_record(&path)
    }

    fn put_if_absent(
        &self,
        namespace: &str,
        host: &str,
        identity: u64,
    ) -> Result<u64, PinStoreError> {
        let path = self.record_path(namespace, host)?;
        if let Some(dir) = path.parent() {
            Self::ensure_dir(dir)?;
        }

        let staged = Self::stage_record(&path, identity)?;
        let pinned = Self::publish(&staged, &path, identity);
        if let Err(e) = fs::remove_file(&staged) {
            debug!(path = %staged.display(), "could not remove staged pin record: {}", e);
        }
        pinned
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryPinStore {
    records: Mutex<HashMap<(String, String), u64>>,
}

impl MemoryPinStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PinStore for MemoryPinStore {
    fn get(&self, namespace: &str, host: &str) -> Result<Option<u64>, PinStoreError> {
        let records = self.records.lock().map_err(|_| PinStoreError::Poisoned)?;
        Ok(records
            .get(&(namespace.to_string(), host.to_string()))
            .copied())
    }

    fn put_if_absent(
        &self,
        namespace: &str,
        host: &str,
        identity: u64,
    ) -> Result<u64, PinStoreError> {
        let mut records = self.records.lock().map_err(|_| PinStoreError::Poisoned)?;
        Ok(*records
            .entry((namespace.to_string(), host.to_string()))
            .or_insert(identity))
    }
}

fn sanitize_component(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let mut clean = String::with_capacity(trimmed.len().min(MAX_HOST_FILE_BYTES));
    for ch in trimmed.chars() {
        let safe = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-');
        clean.push(if safe { ch } else { '_' });
        if clean.len() >= MAX_HOST_FILE_BYTES {
            break;
        }
    }
    let clean = clean.trim_matches('.').to_string();
    if clean.is_empty() {
        return None;
    }
    Some(clean)
}

/// File stem for a host label. Labels that had to be rewritten get a short
/// digest suffix so distinct hosts never share a record.
fn host_file_stem(host: &str) -> Option<String> {
    let clean = sanitize_component(host)?;
    if clean == host {
        return Some(clean);
    }
    let digest = Sha256::digest(host.as_bytes());
    Some(format!("{clean}-{}", hex::encode(&digest[..4])))
}

//! Trust-on-first-use host key verification
//!
//! One [`FingerprintRecord`] per (host id, key algorithm), so a host can have
//! RSA, Ed25519 and ECDSA keys trusted at the same time. A key that matches
//! its stored record is accepted silently; an unknown or changed key goes to
//! the user through [`HostKeyPrompt`] and is only persisted once accepted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::HostId;
use super::error::ConnectError;
use super::prompt::{HostKeyPrompt, HostKeyRequest};

/// Stored fingerprint for one (host, algorithm) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    pub id: String,
    pub host_id: HostId,
    pub algorithm: String,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_trusted: bool,
}

impl FingerprintRecord {
    pub fn trusted(
        host_id: impl Into<String>,
        algorithm: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            host_id: host_id.into(),
            algorithm: algorithm.into(),
            fingerprint: fingerprint.into(),
            first_seen: now,
            last_seen: now,
            is_trusted: true,
        }
    }

    fn matches(&self, fingerprint: &str) -> bool {
        self.is_trusted && bool::from(self.fingerprint.as_bytes().ct_eq(fingerprint.as_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Fingerprint record not found: {0}")]
    RecordNotFound(String),
}

impl From<TrustStoreError> for ConnectError {
    fn from(err: TrustStoreError) -> Self {
        ConnectError::TrustStore(err.to_string())
    }
}

/// Accepted host key fingerprints, shared by every session
///
/// Concurrent upserts of the same pair resolve last-writer-wins.
pub trait TrustStore: Send + Sync {
    fn get_fingerprint(
        &self,
        host_id: &str,
        algorithm: &str,
    ) -> Result<Option<FingerprintRecord>, TrustStoreError>;

    /// Insert a new (host, algorithm) row or replace the existing one
    fn upsert_fingerprint(&self, record: FingerprintRecord) -> Result<(), TrustStoreError>;

    fn touch_last_seen(&self, id: &str) -> Result<(), TrustStoreError>;
}

type RecordKey = (HostId, String);

/// In-memory trust store
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: RwLock<HashMap<RecordKey, FingerprintRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_records(records: Vec<FingerprintRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| ((r.host_id.clone(), r.algorithm.clone()), r))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }

    /// Every record stored for a host, any algorithm
    pub fn records_for_host(&self, host_id: &str) -> Vec<FingerprintRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.host_id == host_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn snapshot(&self) -> Vec<FingerprintRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| (&a.host_id, &a.algorithm).cmp(&(&b.host_id, &b.algorithm)));
        records
    }
}

impl TrustStore for MemoryTrustStore {
    fn get_fingerprint(
        &self,
        host_id: &str,
        algorithm: &str,
    ) -> Result<Option<FingerprintRecord>, TrustStoreError> {
        let key = (host_id.to_string(), algorithm.to_string());
        Ok(self.records.read().get(&key).cloned())
    }

    fn upsert_fingerprint(&self, record: FingerprintRecord) -> Result<(), TrustStoreError> {
        let key = (record.host_id.clone(), record.algorithm.clone());
        self.records.write().insert(key, record);
        Ok(())
    }

    fn touch_last_seen(&self, id: &str) -> Result<(), TrustStoreError> {
        let mut records = self.records.write();
        let record = records
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| TrustStoreError::RecordNotFound(id.to_string()))?;
        record.last_seen = Utc::now();
        Ok(())
    }
}

/// Trust store persisted as a JSON array
///
/// Loaded once at construction, rewritten (temp file + rename) after every
/// change.
#[derive(Debug)]
pub struct FileTrustStore {
    inner: MemoryTrustStore,
    path: PathBuf,
    /// Held across mutate + snapshot + rewrite so writers share the temp file in turn
    write_lock: Mutex<()>,
}

impl FileTrustStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_json::from_str::<Vec<FingerprintRecord>>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Trust store {:?} not found, starting empty", path);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!("Loaded {} trusted host key(s) from {:?}", records.len(), path);
        Ok(Self {
            inner: MemoryTrustStore::from_records(records),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_for_host(&self, host_id: &str) -> Vec<FingerprintRecord> {
        self.inner.records_for_host(host_id)
    }

    fn persist(&self) -> Result<(), TrustStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.inner.snapshot())?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn get_fingerprint(
        &self,
        host_id: &str,
        algorithm: &str,
    ) -> Result<Option<FingerprintRecord>, TrustStoreError> {
        self.inner.get_fingerprint(host_id, algorithm)
    }

    fn upsert_fingerprint(&self, record: FingerprintRecord) -> Result<(), TrustStoreError> {
        let _guard = self.write_lock.lock();
        self.inner.upsert_fingerprint(record)?;
        self.persist()
    }

    fn touch_last_seen(&self, id: &str) -> Result<(), TrustStoreError> {
        let _guard = self.write_lock.lock();
        self.inner.touch_last_seen(id)?;
        self.persist()
    }
}

/// Compute SHA256 fingerprint of a public key blob
pub fn fingerprint_sha256(raw_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Host key as presented during a hop handshake
#[derive(Debug, Clone)]
pub struct PresentedHostKey {
    pub host_id: HostId,
    pub hostname: String,
    pub port: u16,
    pub algorithm: String,
    pub raw_key: Vec<u8>,
}

/// Host-key callback bound to one connect attempt
///
/// Consults the trust store first and only asks the user when the key is
/// unknown or changed.
pub struct TofuVerifier {
    store: Arc<dyn TrustStore>,
    prompt: Arc<dyn HostKeyPrompt>,
}

impl TofuVerifier {
    pub fn new(store: Arc<dyn TrustStore>, prompt: Arc<dyn HostKeyPrompt>) -> Self {
        Self { store, prompt }
    }

    /// Accept or reject a presented key; rejection persists nothing
    pub async fn verify(&self, key: &PresentedHostKey) -> Result<(), ConnectError> {
        let fingerprint = fingerprint_sha256(&key.raw_key);
        let stored = self.store.get_fingerprint(&key.host_id, &key.algorithm)?;

        if let Some(record) = stored.as_ref().filter(|r| r.matches(&fingerprint)) {
            debug!(
                "Host key verified for {}:{} ({})",
                key.hostname, key.port, key.algorithm
            );
            if let Err(e) = self.store.touch_last_seen(&record.id) {
                warn!("Failed to update last-seen for {}: {}", key.host_id, e);
            }
            return Ok(());
        }

        let previous_fingerprint = stored.as_ref().map(|r| r.fingerprint.clone());
        match &previous_fingerprint {
            Some(previous) => warn!(
                "HOST KEY CHANGED for {}:{} ({})! Expected {}, got {}",
                key.hostname, key.port, key.algorithm, previous, fingerprint
            ),
            None => info!(
                "New host key for {}:{} ({}): {}",
                key.hostname, key.port, key.algorithm, fingerprint
            ),
        }

        let request = HostKeyRequest {
            host_id: key.host_id.clone(),
            hostname: key.hostname.clone(),
            port: key.port,
            algorithm: key.algorithm.clone(),
            fingerprint: fingerprint.clone(),
            raw_key: key.raw_key.clone(),
            previous_fingerprint,
        };

        if !self.prompt.confirm_host_key(&request).await {
            warn!(
                "Host key for {}:{} ({}) rejected",
                key.hostname, key.port, key.algorithm
            );
            return Err(ConnectError::HostKeyRejected {
                host: key.hostname.clone(),
                algorithm: key.algorithm.clone(),
            });
        }

        let now = Utc::now();
        let record = match stored {
            Some(existing) => FingerprintRecord {
                fingerprint,
                last_seen: now,
                is_trusted: true,
                ..existing
            },
            None => FingerprintRecord::trusted(&key.host_id, &key.algorithm, fingerprint),
        };
        if let Err(e) = self.store.upsert_fingerprint(record) {
            warn!("Failed to save host key for {}: {}", key.host_id, e);
            return Err(e.into());
        }

        info!(
            "Trusted host key for {}:{} ({})",
            key.hostname, key.port, key.algorithm
        );
        Ok(())
    }
}

//! Knowledge-factor storage with Argon2id hashing
//!
//! Only a PHC hash string is persisted. Candidates are parsed into a
//! [`KnowledgeFactor`] before they reach the store, so malformed input never
//! costs a hash computation.

use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use applock_core::{KnowledgeFactor, LockType};

use crate::error::{DaemonError, Result};

const STORAGE_VERSION: u32 = 1;

/// Validates knowledge-factor candidates
pub trait CredentialStore: Send + Sync {
    /// Check a candidate against the stored credential
    ///
    /// A candidate of the wrong lock type is simply not a match.
    fn validate(&self, candidate: &KnowledgeFactor) -> Result<bool>;
}

/// Credential file format
#[derive(Clone, Serialize, Deserialize)]
struct CredentialRecord {
    /// Argon2id PHC string
    hash: String,
    lock_type: LockType,
    version: u32,
}

/// File-backed credential store
pub struct Argon2CredentialStore {
    path: PathBuf,
    record: RwLock<Option<CredentialRecord>>,
}

impl Argon2CredentialStore {
    /// Open the store, loading an existing credential if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let record: CredentialRecord = serde_json::from_str(&contents).map_err(|e| {
                DaemonError::Credential(format!("Failed to parse credential file: {}", e))
            })?;
            if record.version != STORAGE_VERSION {
                return Err(DaemonError::Credential(format!(
                    "Unsupported credential file version {}",
                    record.version
                )));
            }
            debug!("Loaded {} credential from {:?}", record.lock_type, path);
            Some(record)
        } else {
            None
        };

        Ok(Self {
            path,
            record: RwLock::new(record),
        })
    }

    /// Whether a credential has been set
    pub fn is_set(&self) -> bool {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Lock type of the stored credential
    pub fn lock_type(&self) -> Option<LockType> {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.lock_type)
    }

    /// Replace the stored credential
    pub fn set(&self, credential: &KnowledgeFactor) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let bytes = credential.canonical_bytes();
        let hash = Argon2::default()
            .hash_password(&bytes, &salt)
            .map_err(|e| DaemonError::Credential(format!("Failed to hash credential: {}", e)))?
            .to_string();

        let record = CredentialRecord {
            hash,
            lock_type: credential.lock_type(),
            version: STORAGE_VERSION,
        };
        self.save(&record)?;

        *self.record.write().unwrap_or_else(PoisonError::into_inner) = Some(record);
        info!("Stored new {} credential", credential.lock_type());
        Ok(())
    }

    /// Remove the stored credential
    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        *self.record.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Credential reset");
        Ok(())
    }

    fn save(&self, record: &CredentialRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl CredentialStore for Argon2CredentialStore {
    fn validate(&self, candidate: &KnowledgeFactor) -> Result<bool> {
        let guard = self.record.read().unwrap_or_else(PoisonError::into_inner);
        let record = guard.as_ref().ok_or(DaemonError::CredentialNotSet)?;

        if record.lock_type != candidate.lock_type() {
            return Ok(false);
        }

        let parsed = PasswordHash::new(&record.hash)
            .map_err(|e| DaemonError::Credential(format!("Invalid stored hash: {}", e)))?;
        let bytes = candidate.canonical_bytes();
        Ok(Argon2::default().verify_password(&bytes, &parsed).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pin(value: &str) -> KnowledgeFactor {
        KnowledgeFactor::parse(LockType::Pin, value).unwrap()
    }

    #[test]
    fn test_set_and_validate() {
        let dir = tempdir().unwrap();
        let store = Argon2CredentialStore::open(dir.path().join("credential.json")).unwrap();
        assert!(!store.is_set());
        assert!(matches!(
            store.validate(&pin("123456")),
            Err(DaemonError::CredentialNotSet)
        ));

        store.set(&pin("123456")).unwrap();
        assert!(store.is_set());
        assert_eq!(store.lock_type(), Some(LockType::Pin));
        assert!(store.validate(&pin("123456")).unwrap());
        assert!(!store.validate(&pin("654321")).unwrap());
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("credential.json");

        let pattern = KnowledgeFactor::parse(LockType::Pattern, "0,1,2,5,8").unwrap();
        Argon2CredentialStore::open(&path).unwrap().set(&pattern).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("$argon2id$"));
        assert!(!contents.contains("0,1,2,5,8"));

        let reopened = Argon2CredentialStore::open(&path).unwrap();
        assert_eq!(reopened.lock_type(), Some(LockType::Pattern));
        assert!(reopened.validate(&pattern).unwrap());
    }

    #[test]
    fn test_wrong_lock_type_never_matches() {
        let dir = tempdir().unwrap();
        let store = Argon2CredentialStore::open(dir.path().join("credential.json")).unwrap();
        store.set(&pin("123456")).unwrap();

        let pattern = KnowledgeFactor::parse(LockType::Pattern, "0,1,2,3").unwrap();
        assert!(!store.validate(&pattern).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("credential.json");
        let store = Argon2CredentialStore::open(&path).unwrap();
        store.set(&pin("123456")).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credential.json");
        let store = Argon2CredentialStore::open(&path).unwrap();
        store.set(&pin("123456")).unwrap();

        store.reset().unwrap();
        assert!(!store.is_set());
        assert!(!path.exists());
        assert!(Argon2CredentialStore::open(&path).unwrap().lock_type().is_none());
    }

    #[test]
    fn test_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credential.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Argon2CredentialStore::open(&path),
            Err(DaemonError::Credential(_))
        ));
    }
}

//! Temporary-unlock grant storage
//!
//! The store is the single writer of [`UnlockGrant`]s. Every operation runs
//! under one lock, so "check expiry" and "issue grant" for a package can never
//! interleave with another update to the same package. Grants are kept in
//! memory only; a restart forces re-authentication.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use applock_core::{AuthFactor, PackageName, Timestamp, UnlockGrant};

/// Result of checking a package's grant at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantStatus {
    /// No grant exists
    Absent,
    /// A grant existed but had expired; it has been removed
    Expired(UnlockGrant),
    /// The grant is still valid
    Valid(UnlockGrant),
}

/// In-memory grant store
#[derive(Debug, Default)]
pub struct GrantStore {
    grants: RwLock<HashMap<PackageName, UnlockGrant>>,
}

impl GrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a grant, replacing any previous grant for the package
    pub fn put(&self, package: PackageName, expiry: Timestamp, origin: AuthFactor) -> UnlockGrant {
        let grant = UnlockGrant::new(package.clone(), expiry, origin);
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        grants.insert(package, grant.clone());
        debug!("Issued {} grant for {} until {}", origin, grant.package, expiry);
        grant
    }

    /// Get the stored grant without evaluating expiry
    pub fn get(&self, package: &str) -> Option<UnlockGrant> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        grants.get(package).cloned()
    }

    /// Atomically check a package's grant, deleting it if expired
    pub fn check(&self, package: &str, now: Timestamp) -> GrantStatus {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        match grants.get(package) {
            None => GrantStatus::Absent,
            Some(grant) if grant.is_expired(now) => {
                let expired = grants.remove(package);
                match expired {
                    Some(grant) => {
                        debug!("Grant for {} expired at {}", package, grant.expiry);
                        GrantStatus::Expired(grant)
                    }
                    None => GrantStatus::Absent,
                }
            }
            Some(grant) => GrantStatus::Valid(grant.clone()),
        }
    }

    /// Remove the grant for a package
    pub fn invalidate(&self, package: &str) -> Option<UnlockGrant> {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        grants.remove(package)
    }

    /// Remove all grants (protected set or lock type changed)
    pub fn invalidate_all(&self) -> usize {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        let count = grants.len();
        grants.clear();
        if count > 0 {
            debug!("Invalidated {} grants", count);
        }
        count
    }

    /// Grants still valid at `now`
    pub fn live_grants(&self, now: Timestamp) -> Vec<UnlockGrant> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        let mut live: Vec<_> = grants
            .values()
            .filter(|g| !g.is_expired(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.package.cmp(&b.package));
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bank() -> PackageName {
        PackageName::new("com.example.bank").unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let store = GrantStore::new();
        assert!(store.get("com.example.bank").is_none());

        store.put(bank(), Timestamp::from_secs(35), AuthFactor::Knowledge);
        let grant = store.get("com.example.bank").unwrap();
        assert_eq!(grant.expiry, Timestamp::from_secs(35));
        assert_eq!(grant.origin, AuthFactor::Knowledge);
    }

    #[test]
    fn test_check_valid_then_expired() {
        let store = GrantStore::new();
        store.put(bank(), Timestamp::from_secs(35), AuthFactor::Biometric);

        assert!(matches!(
            store.check("com.example.bank", Timestamp::from_secs(20)),
            GrantStatus::Valid(_)
        ));
        assert!(matches!(
            store.check("com.example.bank", Timestamp::from_secs(40)),
            GrantStatus::Expired(_)
        ));
        // Expired grants are deleted by the check
        assert_eq!(
            store.check("com.example.bank", Timestamp::from_secs(40)),
            GrantStatus::Absent
        );
        assert!(store.get("com.example.bank").is_none());
    }

    #[test]
    fn test_put_replaces_previous_grant() {
        let store = GrantStore::new();
        store.put(bank(), Timestamp::from_secs(10), AuthFactor::Knowledge);
        store.put(bank(), Timestamp::from_secs(50), AuthFactor::Biometric);

        let live = store.live_grants(Timestamp::from_secs(20));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].origin, AuthFactor::Biometric);
    }

    #[test]
    fn test_invalidate_and_invalidate_all() {
        let store = GrantStore::new();
        store.put(bank(), Timestamp::from_secs(35), AuthFactor::Knowledge);
        store.put(
            PackageName::new("com.example.mail").unwrap(),
            Timestamp::from_secs(35),
            AuthFactor::Knowledge,
        );

        assert!(store.invalidate("com.example.bank").is_some());
        assert!(store.invalidate("com.example.bank").is_none());
        assert_eq!(store.invalidate_all(), 1);
        assert!(store.live_grants(Timestamp::ZERO).is_empty());
    }

    #[test]
    fn test_concurrent_checks_expire_once() {
        let store = Arc::new(GrantStore::new());
        store.put(bank(), Timestamp::from_secs(1), AuthFactor::Knowledge);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.check("com.example.bank", Timestamp::from_secs(5)))
            })
            .collect();

        let expired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|status| matches!(status, GrantStatus::Expired(_)))
            .count();
        assert_eq!(expired, 1);
    }
}

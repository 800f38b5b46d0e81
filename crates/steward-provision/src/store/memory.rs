//! In-memory ledger store.
//!
//! This module provides [`InMemoryLedgerStore`], a thread-safe in-memory
//! implementation of the [`LedgerStore`] trait suitable for tests and
//! single-node deployments.
//!
//! ## Limitations
//!
//! - **No durability**: All state is lost when the process exits
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use steward_core::PartnerId;

use super::LedgerStore;
use crate::error::{Error, Result};
use crate::ledger::Partner;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory ledger store.
///
/// ## Example
///
/// ```rust
/// use steward_core::PartnerId;
/// use steward_provision::ledger::Partner;
/// use steward_provision::store::memory::InMemoryLedgerStore;
///
/// let store = InMemoryLedgerStore::new();
/// store.insert(Partner::new(PartnerId::generate(), "Acme", 10, 1));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    partners: RwLock<HashMap<PartnerId, Partner>>,
}

impl InMemoryLedgerStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            partners: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts a partner record directly, bypassing the reservation
    /// manager. Intended for seeding tests and bootstrap.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn insert(&self, partner: Partner) {
        self.partners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partner.id, partner);
    }

    /// Returns the number of partner records currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn partner_count(&self) -> Result<usize> {
        let count = {
            let partners = self.partners.read().map_err(poison_err)?;
            partners.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load(&self, partner_id: PartnerId) -> Result<Option<Partner>> {
        let result = {
            let partners = self.partners.read().map_err(poison_err)?;
            partners.get(&partner_id).cloned()
        };
        Ok(result)
    }

    async fn replace(&self, partner: &Partner) -> Result<()> {
        {
            let mut partners = self.partners.write().map_err(poison_err)?;
            partners.insert(partner.id, partner.clone());
        }
        Ok(())
    }
}

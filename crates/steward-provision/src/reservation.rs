//! Reservation manager: serialized, atomic-per-partner ledger operations.
//!
//! All balance mutation for a partner flows through this type. It owns a
//! per-partner mutex table, so two concurrent `reserve` calls against the
//! same partner can never both observe a stale pre-deduction balance; the
//! second call blocks until the first's mutation is fully applied and
//! visible. Across partners there is no ordering.
//!
//! The manager is an explicitly constructed object, instantiated once per
//! process and passed by reference to all callers. There is no hidden
//! global state.
//!
//! ## Settlement semantics
//!
//! A reservation settles to exactly one of committed (`CONSUME`) or
//! cancelled (`RESERVE_CANCEL`). Both `commit` and `cancel` return `false`
//! rather than an error when they lose the settlement race or repeat, so
//! the orchestrator and the lease sweeper can both call them without
//! coordinating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;

use steward_core::{LedgerEntryId, PartnerId};

use crate::error::{Error, Result};
use crate::ledger::{Partner, PartnerStatus};
use crate::store::LedgerStore;

/// Outcome of a reservation attempt.
///
/// Insufficient balance is an expected business outcome, not a fault, so
/// it is modeled here instead of as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Funds were held; the entry awaits commit or cancel.
    Granted {
        /// The `RESERVE` entry's ID, needed for settlement.
        ledger_id: LedgerEntryId,
        /// Credits held.
        price: i64,
        /// Balance after the hold.
        balance: i64,
    },
    /// The balance cannot cover the price. No mutation occurred.
    Insufficient {
        /// Credits that would be required.
        needed: i64,
        /// Credits currently available.
        balance: i64,
    },
}

impl ReserveOutcome {
    /// Returns true if funds were held.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// Returns the held entry's ID, if granted.
    #[must_use]
    pub const fn ledger_id(&self) -> Option<LedgerEntryId> {
        match self {
            Self::Granted { ledger_id, .. } => Some(*ledger_id),
            Self::Insufficient { .. } => None,
        }
    }
}

/// Serialized per-partner ledger operations over a [`LedgerStore`].
pub struct ReservationManager {
    store: Arc<dyn LedgerStore>,
    locks: StdMutex<HashMap<PartnerId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager").finish_non_exhaustive()
    }
}

impl ReservationManager {
    /// Creates a new manager over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns the serialization mutex for a partner, creating it on first
    /// use.
    fn partner_lock(&self, partner_id: PartnerId) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(partner_id).or_default())
    }

    /// Adds `amount` to a partner's balance and appends a `GRANT` entry.
    ///
    /// Returns the updated record, or `None` if the partner is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self), fields(%partner_id, amount))]
    pub async fn grant(
        &self,
        partner_id: PartnerId,
        amount: i64,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> Result<Option<Partner>> {
        let lock = self.partner_lock(partner_id);
        let _guard = lock.lock().await;

        let Some(mut partner) = self.store.load(partner_id).await? else {
            return Ok(None);
        };
        partner.apply_grant(amount, actor, note);
        self.store.replace(&partner).await?;
        tracing::debug!(balance = partner.balance, "credits granted");
        Ok(Some(partner))
    }

    /// Applies a manual balance correction and appends an `ADJUST` entry.
    ///
    /// Returns the updated record, or `None` if the partner is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self), fields(%partner_id, delta))]
    pub async fn adjust(
        &self,
        partner_id: PartnerId,
        delta: i64,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> Result<Option<Partner>> {
        let lock = self.partner_lock(partner_id);
        let _guard = lock.lock().await;

        let Some(mut partner) = self.store.load(partner_id).await? else {
            return Ok(None);
        };
        partner.apply_adjust(delta, actor, note);
        self.store.replace(&partner).await?;
        tracing::debug!(balance = partner.balance, "balance adjusted");
        Ok(Some(partner))
    }

    /// Holds the partner's per-installation price against their balance.
    ///
    /// On success the funds are removed from availability immediately, so
    /// a second concurrent reservation cannot also succeed on a balance
    /// that is about to be spent. On insufficient balance no mutation
    /// occurs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartnerNotFound`] for an unknown partner,
    /// [`Error::Validation`] for a suspended one, or a storage error.
    #[tracing::instrument(skip(self), fields(%partner_id, temp_ref))]
    pub async fn reserve(
        &self,
        partner_id: PartnerId,
        temp_ref: &str,
        actor: &str,
    ) -> Result<ReserveOutcome> {
        let lock = self.partner_lock(partner_id);
        let _guard = lock.lock().await;

        let Some(mut partner) = self.store.load(partner_id).await? else {
            return Err(Error::PartnerNotFound { partner_id });
        };
        if partner.status == PartnerStatus::Suspended {
            return Err(Error::validation("partner is suspended"));
        }

        let price = partner.price;
        if partner.balance < price {
            tracing::info!(
                needed = price,
                balance = partner.balance,
                "reservation denied: insufficient credits"
            );
            return Ok(ReserveOutcome::Insufficient {
                needed: price,
                balance: partner.balance,
            });
        }

        let ledger_id = partner.apply_reserve(price, temp_ref, actor);
        self.store.replace(&partner).await?;
        tracing::info!(%ledger_id, balance = partner.balance, "credits reserved");
        Ok(ReserveOutcome::Granted {
            ledger_id,
            price,
            balance: partner.balance,
        })
    }

    /// Commits a reservation, turning the hold into a permanent charge.
    ///
    /// Returns `false` if the entry is missing or already settled. This is
    /// safe to call even if a concurrent cancel already fired; exactly one
    /// of commit/cancel ever wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self), fields(%partner_id, %ledger_id, final_ref))]
    pub async fn commit(
        &self,
        partner_id: PartnerId,
        ledger_id: LedgerEntryId,
        final_ref: &str,
    ) -> Result<bool> {
        let lock = self.partner_lock(partner_id);
        let _guard = lock.lock().await;

        let Some(mut partner) = self.store.load(partner_id).await? else {
            return Ok(false);
        };
        if !partner.settle_commit(ledger_id, final_ref) {
            tracing::debug!("commit lost settlement race or repeated");
            return Ok(false);
        }
        self.store.replace(&partner).await?;
        tracing::info!("reservation committed");
        Ok(true)
    }

    /// Cancels a reservation, restoring the held credits.
    ///
    /// Returns `false` if the entry is missing or already settled; the
    /// second cancel of the same entry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(skip(self), fields(%partner_id, %ledger_id))]
    pub async fn cancel(
        &self,
        partner_id: PartnerId,
        ledger_id: LedgerEntryId,
        note: Option<&str>,
    ) -> Result<bool> {
        let lock = self.partner_lock(partner_id);
        let _guard = lock.lock().await;

        let Some(mut partner) = self.store.load(partner_id).await? else {
            return Ok(false);
        };
        if !partner.settle_cancel(ledger_id, note) {
            tracing::debug!("cancel lost settlement race or repeated");
            return Ok(false);
        }
        self.store.replace(&partner).await?;
        tracing::info!(balance = partner.balance, "reservation cancelled");
        Ok(true)
    }

    /// Returns a point-in-time snapshot of a partner record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn snapshot(&self, partner_id: PartnerId) -> Result<Option<Partner>> {
        self.store.load(partner_id).await
    }
}

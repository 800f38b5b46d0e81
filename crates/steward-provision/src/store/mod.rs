//! Pluggable storage for partner ledger records.
//!
//! The [`LedgerStore`] trait defines the persistence layer for partner
//! records. The reservation manager performs all mutation through it.
//!
//! ## Design Principles
//!
//! - **Full-record semantics**: Every mutation is a read of the whole
//!   partner record followed by an atomic replace. There are no partial or
//!   indexed updates, which bounds this design to moderate partner counts
//!   and entry-history sizes.
//! - **Crash safety**: `replace` must apply the record as one atomic
//!   write, so a crash mid-operation never leaves the balance inconsistent
//!   with the ledger sum.
//! - **Testability**: In-memory implementation for tests and single-node
//!   deployments; a transactional backend can be swapped in behind the
//!   same trait.

pub mod memory;

use async_trait::async_trait;

use steward_core::PartnerId;

use crate::error::Result;
use crate::ledger::Partner;

/// Storage abstraction for partner ledger records.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`. The store itself does not serialize
/// callers per partner; the reservation manager owns that critical
/// section and the store only guarantees that each `replace` is atomic.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Loads a partner record by ID.
    ///
    /// Returns `None` if the partner does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn load(&self, partner_id: PartnerId) -> Result<Option<Partner>>;

    /// Atomically replaces a partner record with the given state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    async fn replace(&self, partner: &Partner) -> Result<()>;
}

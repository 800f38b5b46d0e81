//! Partner wallet and credit ledger records.
//!
//! A partner's record is the system of record for billing: a wallet
//! balance plus an append-style list of ledger entries. The central
//! invariant is that the balance equals the sum of entry deltas after
//! every single mutation, never just eventually.
//!
//! ## Entry lifecycle
//!
//! Entries are created once. A `RESERVE` entry may later be rewritten in
//! place to `CONSUME` (on commit) or `RESERVE_CANCEL` (on cancel); these
//! are the only legal reason transitions and each may happen at most once.
//! `GRANT` and `ADJUST` entries are immutable once written.
//!
//! Because cancellation restores the held credits without appending a
//! compensating entry, the cancelled entry's delta is zeroed so the
//! balance invariant keeps holding; the released amount is recorded in
//! the entry note.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use steward_core::{LedgerEntryId, PartnerId};

/// Reason a ledger entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReason {
    /// Credits granted by an operator or purchase.
    Grant,
    /// Credits consumed by a committed installation.
    Consume,
    /// Manual balance correction.
    Adjust,
    /// Credits held for an in-flight installation.
    Reserve,
    /// A reservation that was released without being consumed.
    ReserveCancel,
}

impl LedgerReason {
    /// Returns true if an entry with this reason can be rewritten to the
    /// target reason.
    ///
    /// Only `Reserve` entries are rewritable, and only to one of the two
    /// settlement reasons.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Reserve, Self::Consume | Self::ReserveCancel)
        )
    }

    /// Returns true if an entry with this reason is settled and can never
    /// change again.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Reserve)
    }
}

impl std::fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grant => write!(f, "GRANT"),
            Self::Consume => write!(f, "CONSUME"),
            Self::Adjust => write!(f, "ADJUST"),
            Self::Reserve => write!(f, "RESERVE"),
            Self::ReserveCancel => write!(f, "RESERVE_CANCEL"),
        }
    }
}

/// One balance-affecting event in a partner's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub id: LedgerEntryId,
    /// Signed credit delta applied to the balance.
    pub delta: i64,
    /// Why this entry exists.
    pub reason: LedgerReason,
    /// Free-form reference (job domain, invoice number, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Who caused the entry (operator or member identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Free-form note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a new entry with the given delta and reason.
    #[must_use]
    pub fn new(delta: i64, reason: LedgerReason) -> Self {
        Self {
            id: LedgerEntryId::generate(),
            delta,
            reason,
            reference: None,
            actor: None,
            note: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the reference.
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Partner lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartnerStatus {
    /// Active and allowed to install.
    Active,
    /// Suspended; installations are rejected.
    Suspended,
}

impl Default for PartnerStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Durable per-partner record: wallet balance plus full ledger history.
///
/// Every mutation is applied as a full-record read-modify-write; the store
/// replaces the whole record atomically. This bounds the design to
/// moderate partner counts and entry-history sizes, which is a documented
/// scaling limit of the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    /// Unique partner identifier.
    pub id: PartnerId,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: PartnerStatus,
    /// Current wallet balance in credits.
    pub balance: i64,
    /// Credits charged per installation.
    pub price: i64,
    /// Member identifiers with access to this partner.
    #[serde(default)]
    pub members: Vec<String>,
    /// Full ledger history, oldest first.
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    /// Creates a new partner with a starting balance and per-installation
    /// price.
    ///
    /// A non-zero starting balance is recorded as an initial `GRANT` entry
    /// so the balance invariant holds from the first observable moment.
    #[must_use]
    pub fn new(id: PartnerId, name: impl Into<String>, balance: i64, price: i64) -> Self {
        let now = Utc::now();
        let entries = if balance == 0 {
            Vec::new()
        } else {
            vec![LedgerEntry::new(balance, LedgerReason::Grant).with_note("initial balance")]
        };
        Self {
            id,
            name: name.into(),
            status: PartnerStatus::Active,
            balance,
            price,
            members: Vec::new(),
            entries,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the sum of all entry deltas.
    #[must_use]
    pub fn ledger_sum(&self) -> i64 {
        self.entries.iter().map(|e| e.delta).sum()
    }

    /// Returns true if the balance matches the ledger sum.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum()
    }

    /// Looks up an entry by ID.
    #[must_use]
    pub fn entry(&self, id: LedgerEntryId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn entry_mut(&mut self, id: LedgerEntryId) -> Option<&mut LedgerEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        debug_assert!(self.is_consistent(), "balance diverged from ledger sum");
    }

    /// Adds `amount` to the balance and appends a `GRANT` entry.
    ///
    /// Returns the new entry's ID.
    pub fn apply_grant(
        &mut self,
        amount: i64,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> LedgerEntryId {
        let mut entry = LedgerEntry::new(amount, LedgerReason::Grant);
        if let Some(actor) = actor {
            entry = entry.with_actor(actor);
        }
        if let Some(note) = note {
            entry = entry.with_note(note);
        }
        let id = entry.id;
        self.balance += amount;
        self.entries.push(entry);
        self.touch();
        id
    }

    /// Applies a manual balance correction and appends an `ADJUST` entry.
    ///
    /// Returns the new entry's ID.
    pub fn apply_adjust(
        &mut self,
        delta: i64,
        actor: Option<&str>,
        note: Option<&str>,
    ) -> LedgerEntryId {
        let mut entry = LedgerEntry::new(delta, LedgerReason::Adjust);
        if let Some(actor) = actor {
            entry = entry.with_actor(actor);
        }
        if let Some(note) = note {
            entry = entry.with_note(note);
        }
        let id = entry.id;
        self.balance += delta;
        self.entries.push(entry);
        self.touch();
        id
    }

    /// Deducts `amount` from the balance and appends a `RESERVE` entry.
    ///
    /// The caller must have already verified `balance >= amount`; the
    /// reservation manager does this inside its per-partner critical
    /// section.
    pub fn apply_reserve(&mut self, amount: i64, reference: &str, actor: &str) -> LedgerEntryId {
        debug_assert!(self.balance >= amount, "reserve past available balance");
        let entry = LedgerEntry::new(-amount, LedgerReason::Reserve)
            .with_reference(reference)
            .with_actor(actor);
        let id = entry.id;
        self.balance -= amount;
        self.entries.push(entry);
        self.touch();
        id
    }

    /// Settles a `RESERVE` entry as consumed, making the charge permanent.
    ///
    /// Returns false if the entry is missing or already settled; the
    /// record is untouched in that case.
    pub fn settle_commit(&mut self, entry_id: LedgerEntryId, final_ref: &str) -> bool {
        let Some(entry) = self.entry_mut(entry_id) else {
            return false;
        };
        if !entry.reason.can_transition_to(LedgerReason::Consume) {
            return false;
        }
        entry.reason = LedgerReason::Consume;
        entry.reference = Some(final_ref.to_string());
        self.touch();
        true
    }

    /// Settles a `RESERVE` entry as cancelled, restoring the held credits.
    ///
    /// Returns false if the entry is missing or already settled (the second
    /// cancel of the same entry is a no-op). The entry's delta is zeroed so
    /// the balance invariant holds without a compensating entry; the
    /// released amount goes into the note.
    pub fn settle_cancel(&mut self, entry_id: LedgerEntryId, note: Option<&str>) -> bool {
        let Some(entry) = self.entry_mut(entry_id) else {
            return false;
        };
        if !entry.reason.can_transition_to(LedgerReason::ReserveCancel) {
            return false;
        }
        let released = entry.delta.abs();
        entry.reason = LedgerReason::ReserveCancel;
        entry.delta = 0;
        entry.note = Some(match note {
            Some(note) => format!("released {released} credits: {note}"),
            None => format!("released {released} credits"),
        });
        self.balance += released;
        self.touch();
        true
    }
}

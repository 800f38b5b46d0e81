//! # steward-provision
//!
//! Installation orchestration saga for the Steward provisioning platform.
//!
//! This crate implements the provisioning domain, providing:
//!
//! - **Credit Ledger**: Per-partner wallet with reserve/commit/cancel semantics
//! - **Saga Orchestration**: Sequential provisioning steps with compensation on failure
//! - **Step Tracking**: Full observability of job progress and outcomes
//! - **Lease Sweep**: Server-owned expiry for abandoned reservations
//!
//! ## Core Concepts
//!
//! - **Reservation**: A ledger entry that tentatively debits a partner's
//!   balance before the associated work is guaranteed to succeed
//! - **Job**: One end-to-end installation attempt for a domain, composed of
//!   an ordered step sequence
//! - **Compensation**: Reversing a reservation when the work it guarded
//!   ultimately fails
//!
//! ## Guarantees
//!
//! - **Balance integrity**: A partner's balance always equals the sum of its
//!   ledger entry deltas, after every single mutation
//! - **At-most-once settlement**: A reservation settles to exactly one of
//!   consumed or cancelled, never both
//! - **Strict step ordering**: No step starts before its predecessor
//!   succeeds; once a step errors, later steps never leave `Pending`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use steward_core::PartnerId;
//! use steward_provision::broadcast::ProgressBroadcaster;
//! use steward_provision::config::ProvisionConfig;
//! use steward_provision::error::Result;
//! use steward_provision::ledger::Partner;
//! use steward_provision::orchestrator::{InstallRequest, Orchestrator};
//! use steward_provision::reservation::ReservationManager;
//! use steward_provision::runner::ScriptedRunner;
//! use steward_provision::step::SourceKind;
//! use steward_provision::store::memory::InMemoryLedgerStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let store = Arc::new(InMemoryLedgerStore::new());
//! let partner = Partner::new(PartnerId::generate(), "Acme Hosting", 10, 1);
//! store.insert(partner.clone());
//!
//! let reservations = Arc::new(ReservationManager::new(store));
//! let orchestrator = Orchestrator::new(
//!     reservations,
//!     Arc::new(ScriptedRunner::all_succeed()),
//!     Arc::new(ProgressBroadcaster::new(64)),
//!     ProvisionConfig::default(),
//! );
//!
//! let request = InstallRequest::new(partner.id, "customer.example.com", SourceKind::Package);
//! let report = orchestrator.run(request).await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod lease;
pub mod ledger;
pub mod orchestrator;
pub mod process;
pub mod reservation;
pub mod runner;
pub mod step;
pub mod store;
pub mod tracker;

//! # steward-core
//!
//! Core abstractions for the Steward provisioning platform.
//!
//! This crate provides the foundational types used across all Steward
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for partners, jobs, and ledger entries
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging initialization
//!
//! ## Crate Boundary
//!
//! `steward-core` is the **only** crate allowed to define shared primitives.
//! All cross-component interaction happens via the types defined here.
//!
//! ## Example
//!
//! ```rust
//! use steward_core::prelude::*;
//!
//! let partner = PartnerId::generate();
//! let job = JobId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{JobId, LedgerEntryId, PartnerId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use steward_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{JobId, LedgerEntryId, PartnerId};
    pub use crate::observability::{init_logging, LogFormat};
}

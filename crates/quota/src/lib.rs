//! Transfer quota ledger (pure arithmetic).
//!
//! No IO, no persistence: stores in `dirpack-infra` load a `QuotaAccount`,
//! apply one of these operations under a single-row lock, and write it back.

pub mod account;
pub mod policy;

pub use account::{OwnerKey, QuotaAccount, QuotaMovement, QuotaSnapshot};
pub use policy::{QuotaError, QuotaPolicy};

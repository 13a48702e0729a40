//! Quota ledger persistence.
//!
//! The arithmetic lives in `dirpack-quota`; stores here apply it as a
//! single-row atomic update so concurrent debits and credits for one
//! account never race.

pub mod postgres;
pub mod store;

pub use postgres::PostgresQuotaLedger;
pub use store::{InMemoryQuotaLedger, QuotaLedger, QuotaStoreError};

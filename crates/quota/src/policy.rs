use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::{OwnerKey, QuotaAccount};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("no quota account for {0}")]
    UnknownAccount(OwnerKey),
    #[error("quota exceeded for {owner_key}: requested {requested} bytes, {remaining} remaining")]
    Exceeded {
        owner_key: OwnerKey,
        requested: u64,
        remaining: u64,
    },
}

/// Admission rule applied before a submission debits an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPolicy {
    /// Debit optimistically; never reject on balance.
    #[default]
    Soft,
    /// Reject when `bytes_used + requested > bytes_available`.
    Hard,
}

impl QuotaPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "soft" => Some(Self::Soft),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn admit(&self, account: &QuotaAccount, requested: u64) -> Result<(), QuotaError> {
        match self {
            QuotaPolicy::Soft => Ok(()),
            QuotaPolicy::Hard if account.would_exceed(requested) => Err(QuotaError::Exceeded {
                owner_key: account.owner_key().clone(),
                requested,
                remaining: account.remaining(),
            }),
            QuotaPolicy::Hard => Ok(()),
        }
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use dirpack_quota::{OwnerKey, QuotaAccount, QuotaMovement, QuotaSnapshot};

/// Persisted quota accounts.
///
/// `debit` and `credit` are atomic per account. `credit` floors usage at zero.
pub trait QuotaLedger: Send + Sync {
    /// Create the account, or replace its allowance if it already exists.
    /// Usage is left untouched on an existing account.
    fn open_account(&self, key: &OwnerKey, bytes_available: u64) -> Result<QuotaAccount, QuotaStoreError>;

    fn account(&self, key: &OwnerKey) -> Result<Option<QuotaAccount>, QuotaStoreError>;

    fn debit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError>;

    fn credit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError>;

    fn snapshot(&self, key: &OwnerKey) -> Result<Option<QuotaSnapshot>, QuotaStoreError> {
        Ok(self.account(key)?.map(|a| a.snapshot()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaStoreError {
    #[error("no quota account for {0}")]
    UnknownAccount(OwnerKey),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory ledger for tests/dev. One mutex serialises every movement.
#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    accounts: Mutex<HashMap<OwnerKey, QuotaAccount>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(
        &self,
        key: &OwnerKey,
        op: impl FnOnce(&mut QuotaAccount) -> QuotaMovement,
    ) -> Result<QuotaMovement, QuotaStoreError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(key)
            .ok_or_else(|| QuotaStoreError::UnknownAccount(key.clone()))?;
        Ok(op(account))
    }
}

impl QuotaLedger for InMemoryQuotaLedger {
    fn open_account(&self, key: &OwnerKey, bytes_available: u64) -> Result<QuotaAccount, QuotaStoreError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(key.clone())
            .or_insert_with(|| QuotaAccount::new(key.clone(), bytes_available));
        account.set_available(bytes_available);
        Ok(account.clone())
    }

    fn account(&self, key: &OwnerKey) -> Result<Option<QuotaAccount>, QuotaStoreError> {
        Ok(self.accounts.lock().unwrap().get(key).cloned())
    }

    fn debit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError> {
        self.apply(key, |a| a.debit(bytes))
    }

    fn credit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError> {
        self.apply(key, |a| a.credit(bytes))
    }
}

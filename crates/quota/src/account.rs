use serde::{Deserialize, Serialize};

use dirpack_core::DomainError;

/// Billable identity a quota is kept for (e.g. `"<account>:<tier>"`).
///
/// One owner may hold several keys, one per account tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("quota owner key must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only view of an account, as served to quota displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub bytes_used: u64,
    pub bytes_available: u64,
}

impl QuotaSnapshot {
    pub fn remaining(&self) -> u64 {
        self.bytes_available.saturating_sub(self.bytes_used)
    }
}

/// Effect of one debit or credit, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaMovement {
    pub requested: u64,
    /// Bytes actually moved; a credit clamped at zero moves less than requested.
    pub applied: u64,
    pub bytes_used_after: u64,
}

impl QuotaMovement {
    pub fn was_clamped(&self) -> bool {
        self.applied < self.requested
    }
}

/// Per-owner transfer ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    owner_key: OwnerKey,
    bytes_available: u64,
    bytes_used: u64,
}

impl QuotaAccount {
    pub fn new(owner_key: OwnerKey, bytes_available: u64) -> Self {
        Self::with_usage(owner_key, bytes_available, 0)
    }

    /// Rehydrate an account from stored counters.
    pub fn with_usage(owner_key: OwnerKey, bytes_available: u64, bytes_used: u64) -> Self {
        Self {
            owner_key,
            bytes_available,
            bytes_used,
        }
    }

    pub fn owner_key(&self) -> &OwnerKey {
        &self.owner_key
    }

    pub fn bytes_available(&self) -> u64 {
        self.bytes_available
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn remaining(&self) -> u64 {
        self.bytes_available.saturating_sub(self.bytes_used)
    }

    /// Whether debiting `bytes` would push usage past the available allowance.
    pub fn would_exceed(&self, bytes: u64) -> bool {
        self.bytes_used.saturating_add(bytes) > self.bytes_available
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            bytes_used: self.bytes_used,
            bytes_available: self.bytes_available,
        }
    }

    /// Unconditional debit: usage grows even past the allowance.
    pub fn debit(&mut self, bytes: u64) -> QuotaMovement {
        let before = self.bytes_used;
        self.bytes_used = before.saturating_add(bytes);
        QuotaMovement {
            requested: bytes,
            applied: self.bytes_used - before,
            bytes_used_after: self.bytes_used,
        }
    }

    /// Compensating credit, floored at zero.
    pub fn credit(&mut self, bytes: u64) -> QuotaMovement {
        let before = self.bytes_used;
        self.bytes_used = before.saturating_sub(bytes);
        QuotaMovement {
            requested: bytes,
            applied: before - self.bytes_used,
            bytes_used_after: self.bytes_used,
        }
    }

    /// Replace the allowance (plan change, top-up).
    pub fn set_available(&mut self, bytes_available: u64) {
        self.bytes_available = bytes_available;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> OwnerKey {
        OwnerKey::new("acct-1:regular").unwrap()
    }

    #[test]
    fn blank_owner_key_is_rejected() {
        assert!(OwnerKey::new("   ").is_err());
        assert_eq!(OwnerKey::new(" a:b ").unwrap().as_str(), "a:b");
    }

    #[test]
    fn debit_is_not_blocked_by_the_allowance() {
        let mut account = QuotaAccount::new(key(), 100);
        let movement = account.debit(250);
        assert_eq!(movement.applied, 250);
        assert_eq!(account.bytes_used(), 250);
        assert_eq!(account.remaining(), 0);
    }

    #[test]
    fn credit_clamps_at_zero() {
        let mut account = QuotaAccount::with_usage(key(), 1_000, 300);
        let movement = account.credit(500);
        assert_eq!(account.bytes_used(), 0);
        assert_eq!(movement.applied, 300);
        assert!(movement.was_clamped());
    }

    #[test]
    fn failed_two_gigabyte_build_restores_prior_usage() {
        let mut account = QuotaAccount::with_usage(key(), 10_000_000_000, 1_234);
        account.debit(2_000_000_000);
        account.credit(2_000_000_000);
        assert_eq!(account.bytes_used(), 1_234);
    }

    #[test]
    fn compensation_after_foreign_credit_never_goes_negative() {
        let mut account = QuotaAccount::new(key(), 10_000_000_000);
        account.debit(2_000_000_000);
        // Another job's compensation lands first and over-credits.
        account.credit(2_500_000_000);
        account.credit(2_000_000_000);
        assert_eq!(account.bytes_used(), 0);
    }

    #[test]
    fn would_exceed_compares_against_remaining() {
        let account = QuotaAccount::with_usage(key(), 100, 60);
        assert!(!account.would_exceed(40));
        assert!(account.would_exceed(41));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Debit(u64),
        Credit(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..5_000_000_000u64).prop_map(Op::Debit),
            (0u64..5_000_000_000u64).prop_map(Op::Credit),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Usage equals the running sum of movements, floored at zero after every credit.
        #[test]
        fn usage_tracks_a_floored_running_sum(ops in prop::collection::vec(op(), 0..50)) {
            let mut account = QuotaAccount::new(key(), u64::MAX / 2);
            let mut model: i128 = 0;

            for op in ops {
                match op {
                    Op::Debit(b) => {
                        account.debit(b);
                        model += b as i128;
                    }
                    Op::Credit(b) => {
                        account.credit(b);
                        model = (model - b as i128).max(0);
                    }
                }
                prop_assert_eq!(account.bytes_used() as i128, model);
            }
        }

        /// A debit followed by its own compensation is a no-op on an uncontended account.
        #[test]
        fn debit_then_credit_is_identity(start in 0u64..1_000_000_000_000, bytes in 0u64..1_000_000_000_000) {
            let mut account = QuotaAccount::with_usage(key(), u64::MAX, start);
            account.debit(bytes);
            account.credit(bytes);
            prop_assert_eq!(account.bytes_used(), start);
        }
    }
}

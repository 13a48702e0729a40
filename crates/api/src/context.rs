use dirpack_core::OwnerId;

/// Caller identity for a request.
///
/// Resolved by [`crate::middleware::owner_middleware`] and present on every
/// owner-scoped route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }
}

use dirpack_core::OwnerId;

use crate::envelope::ChannelEvent;

/// Messages that belong to exactly one owner's topic.
///
/// Stream endpoints use this to forward only the caller's own notifications.
pub trait OwnerScoped {
    fn owner_id(&self) -> OwnerId;
}

impl OwnerScoped for ChannelEvent {
    fn owner_id(&self) -> OwnerId {
        self.owner_id()
    }
}

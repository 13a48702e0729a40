//! Real-time job notifications and the pub/sub mechanics that carry them.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod owner;

pub use bus::{EventBus, Subscription};
pub use envelope::{ChannelEvent, JobEvent, TOPIC_PREFIX};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use owner::OwnerScoped;

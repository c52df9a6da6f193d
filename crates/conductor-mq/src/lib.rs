//! Topic-based event bus for Conductor.
//!
//! Topics are ordered string segments such as `buildrequests.44.claimed`.
//! Subscribers register a [`TopicPattern`] and receive every message published
//! to a matching topic.

pub mod bus;
pub mod error;
pub mod topic;

pub use bus::{EventBus, Message, Publisher, Subscription};
pub use error::{MqError, MqResult};
pub use topic::{Topic, TopicPattern};

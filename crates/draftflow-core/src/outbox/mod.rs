//! Durable outbound notification messages.

mod message;
mod sender;

pub use message::{MessageStatus, NewMessage, QueueStats, QueuedMessage};
pub use sender::{DeliveryError, NotificationSender};

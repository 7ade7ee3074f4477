mod queue;
mod sweeper;
mod webhook;

pub use queue::{OutboundQueue, SweepStats};
pub use sweeper::Sweeper;
pub use webhook::WebhookSender;

pub mod events;
pub mod feed;
pub mod presence;
pub mod service;
pub mod session;
pub mod sweeper;
pub mod transport;
pub mod typing;

#[cfg(test)]
mod test_support;

pub use events::ChatEvent;
pub use feed::{ChangeFeed, Subscription};
pub use presence::{PresenceGuard, PresenceTracker};
pub use service::{MessageDraft, MessagingService};
pub use session::{ChatSession, SessionError};
pub use transport::{ConnectionHub, Delivery, FeedTransport, Transport};
pub use typing::{TypingChannel, TypingSubscription};

pub mod chat;
pub mod conversation;
pub mod store;
pub mod sync;

#[cfg(test)]
pub mod testing;

pub use chat::{ChatOptions, SessionEvent};
pub use store::{ConversationStore, PersistenceError};
pub use sync::PersistenceSync;

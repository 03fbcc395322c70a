//! Postbox Core - message model, settings and error taxonomy
//!
//! This crate carries everything shared between the producer side (storing
//! messages inside business transactions) and the listener side (draining
//! them). It contains no listener logic of its own.

pub mod bootstrap;
pub mod error;
pub mod message;
pub mod settings;
pub mod storage;

pub use error::{ErrorCode, ListenerError, ListenerResult};
pub use message::{Concurrency, MessageKind, NewMessage, StoredMessage};
pub use settings::{
    CleanupSettings, DatabaseSettings, ListenerSettings, PollingSettings, ReplicationSettings,
};
pub use storage::store_message;

//! Handler registration and selection

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use postbox_core::{ListenerError, ListenerResult, StoredMessage};
use sqlx::PgConnection;

/// User-supplied message handler.
///
/// `handle` receives a connection enrolled in the listener's transaction;
/// writes through it commit atomically with the message's state transition.
/// The handler future is dropped when the processing timeout fires, so
/// long-running work should either be cancellation-safe or carry its own
/// internal deadline.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &StoredMessage,
        conn: &mut PgConnection,
    ) -> anyhow::Result<()>;

    /// Invoked by the error orchestrator inside its own transaction, with the
    /// retry decision already made. The default does nothing.
    async fn handle_error(
        &self,
        _error: &ListenerError,
        _message: &StoredMessage,
        _conn: &mut PgConnection,
        _will_retry: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

type HandlerKey = (String, String);

/// Maps `(aggregate_type, message_type)` to a handler, or routes everything
/// to a single catch-all.
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn MessageHandler>>,
    catch_all: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            handlers: Vec::new(),
        }
    }

    /// A registry that routes every message to one handler
    pub fn catch_all(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            catch_all: Some(handler),
        }
    }

    /// Constant-time lookup. `None` means the message has no handler; the
    /// processor completes such messages so they never block the stream.
    pub fn select(&self, message: &StoredMessage) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = &self.catch_all {
            return Some(Arc::clone(handler));
        }
        self.handlers
            .get(&(
                message.aggregate_type.clone(),
                message.message_type.clone(),
            ))
            .cloned()
    }
}

/// Collects typed handlers; duplicates and empty registrations are rejected
/// when the registry is built.
pub struct HandlerRegistryBuilder {
    handlers: Vec<(HandlerKey, Arc<dyn MessageHandler>)>,
}

impl HandlerRegistryBuilder {
    pub fn register(
        mut self,
        aggregate_type: impl Into<String>,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers
            .push(((aggregate_type.into(), message_type.into()), handler));
        self
    }

    pub fn build(self) -> ListenerResult<HandlerRegistry> {
        if self.handlers.is_empty() {
            return Err(ListenerError::NoMessageHandlerRegistered);
        }

        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (key, handler) in self.handlers {
            if handlers.insert(key.clone(), handler).is_some() {
                return Err(ListenerError::ConflictingMessageHandlers {
                    aggregate_type: key.0,
                    message_type: key.1,
                });
            }
        }

        Ok(HandlerRegistry {
            handlers,
            catch_all: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use postbox_core::ErrorCode;
    use serde_json::json;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(
            &self,
            _message: &StoredMessage,
            _conn: &mut PgConnection,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn message(aggregate_type: &str, message_type: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: "1".to_string(),
            message_type: message_type.to_string(),
            segment: None,
            concurrency: None,
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
            locked_until: None,
            started_attempts: 0,
            finished_attempts: 0,
            processed_at: None,
            abandoned_at: None,
        }
    }

    #[test]
    fn empty_registration_is_rejected() {
        let err = HandlerRegistry::builder().build().expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::NoMessageHandlerRegistered);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = HandlerRegistry::builder()
            .register("movie", "movie_created", Arc::new(NoopHandler))
            .register("movie", "movie_created", Arc::new(NoopHandler))
            .build()
            .expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::ConflictingMessageHandlers);
    }

    #[test]
    fn selection_is_keyed_by_aggregate_and_message_type() {
        let registry = HandlerRegistry::builder()
            .register("movie", "movie_created", Arc::new(NoopHandler))
            .build()
            .expect("registry");

        assert!(registry.select(&message("movie", "movie_created")).is_some());
        assert!(registry.select(&message("movie", "movie_deleted")).is_none());
        assert!(registry.select(&message("book", "movie_created")).is_none());
    }

    #[test]
    fn catch_all_matches_everything() {
        let registry = HandlerRegistry::catch_all(Arc::new(NoopHandler));
        assert!(registry.select(&message("anything", "at_all")).is_some());
    }
}

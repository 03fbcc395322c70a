//! Producer-side message storage
//!
//! The insert is generic over the executor so it can join the business
//! transaction that mutates aggregate state; committing that transaction
//! atomically publishes the message.

use sqlx::PgExecutor;
use tracing::debug;

use crate::error::{ListenerError, ListenerResult};
use crate::message::NewMessage;

/// Insert a message row, ignoring duplicates by id.
///
/// Returns `false` when a row with the same id already existed, which makes
/// producers idempotent under redelivery.
pub async fn store_message<'e, E>(
    executor: E,
    qualified_table: &str,
    message: &NewMessage,
) -> ListenerResult<bool>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        INSERT INTO {qualified_table}
            (id, aggregate_type, aggregate_id, message_type, segment, concurrency,
             payload, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (id) DO NOTHING
        "#
    );

    let result = sqlx::query(&sql)
        .bind(message.id)
        .bind(&message.aggregate_type)
        .bind(&message.aggregate_id)
        .bind(&message.message_type)
        .bind(&message.segment)
        .bind(message.concurrency.as_str())
        .bind(&message.payload)
        .bind(&message.metadata)
        .execute(executor)
        .await
        .map_err(|source| ListenerError::MessageStorageFailed {
            message_id: message.id,
            source,
        })?;

    let inserted = result.rows_affected() == 1;
    if !inserted {
        debug!(message_id = %message.id, "message already stored, skipping");
    }
    Ok(inserted)
}

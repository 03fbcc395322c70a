//! Listener configuration
//!
//! Loads configuration from environment variables with documented defaults.
//! The outbox and inbox sides differ only in their default table name and
//! protection flags.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::message::MessageKind;

/// Database connection settings
///
/// The pool is deliberately small by default: each in-flight message holds
/// exactly one connection for its whole processing transaction.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Database connection URL
    pub url: String,

    /// Maximum pool size
    pub max_connections: u32,

    /// How long a message may wait for a free connection before its
    /// processing attempt fails with `DB_ERROR`
    pub acquire_timeout: Duration,

    /// Drop connections idle longer than this (poll loops leave the pool
    /// idle between batches)
    pub idle_timeout: Duration,

    /// Recycle connections after this lifetime
    pub max_lifetime: Duration,
}

impl DatabaseSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::new(env::var("DATABASE_URL").context("DATABASE_URL must be set")?);
        Ok(Self {
            max_connections: env_parse("POSTBOX_DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: env_secs(
                "POSTBOX_DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout,
            )?,
            idle_timeout: env_secs("POSTBOX_DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            max_lifetime: env_secs("POSTBOX_DB_MAX_LIFETIME_SECS", defaults.max_lifetime)?,
            url: defaults.url,
        })
    }
}

/// Age thresholds for the periodic cleanup of terminal rows
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// How often the cleanup runs; zero disables it entirely
    pub interval: Duration,

    /// Delete processed rows older than this
    pub processed_max_age: Option<Duration>,

    /// Delete abandoned rows older than this
    pub abandoned_max_age: Option<Duration>,

    /// Delete any row older than this, terminal or not
    pub all_max_age: Option<Duration>,
}

impl CleanupSettings {
    /// The cleanup only runs when it has an interval and at least one threshold
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
            && (self.processed_max_age.is_some()
                || self.abandoned_max_age.is_some()
                || self.all_max_age.is_some())
    }
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300_000),
            processed_max_age: Some(Duration::from_secs(604_800)),
            abandoned_max_age: Some(Duration::from_secs(1_209_600)),
            all_max_age: Some(Duration::from_secs(5_184_000)),
        }
    }
}

/// Settings shared by both acquisition strategies
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Which side this listener serves; labels logs and picks defaults
    pub kind: MessageKind,

    /// Schema of the message table
    pub db_schema: String,

    /// Name of the message table
    pub db_table: String,

    /// Per-message handler timeout
    pub message_processing_timeout: Duration,

    /// Retry ceiling consulted by the default retry strategy
    pub max_attempts: i32,

    /// Apply the retry ceiling at all (outbox: off, inbox: on)
    pub enable_max_attempts_protection: bool,

    /// Attempt gap at which a message is declared poisonous
    pub max_poisonous_attempts: i32,

    /// Run the started-attempts bump and gap check (outbox: off, inbox: on)
    pub enable_poisonous_message_protection: bool,

    /// Extra lock attempts when a just-announced row is not yet visible
    pub max_message_not_found_attempts: u32,

    /// Wait between those attempts
    pub max_message_not_found_delay: Duration,

    pub cleanup: CleanupSettings,
}

impl ListenerSettings {
    fn defaults(kind: MessageKind) -> Self {
        let inbox = kind == MessageKind::Inbox;
        Self {
            kind,
            db_schema: "public".to_string(),
            db_table: kind.default_table().to_string(),
            message_processing_timeout: Duration::from_millis(15_000),
            max_attempts: 5,
            enable_max_attempts_protection: inbox,
            max_poisonous_attempts: 3,
            enable_poisonous_message_protection: inbox,
            max_message_not_found_attempts: 0,
            max_message_not_found_delay: Duration::from_millis(10),
            cleanup: CleanupSettings::default(),
        }
    }

    /// Code defaults for an outbox listener
    pub fn outbox() -> Self {
        Self::defaults(MessageKind::Outbox)
    }

    /// Code defaults for an inbox listener
    pub fn inbox() -> Self {
        Self::defaults(MessageKind::Inbox)
    }

    /// Load settings from environment variables, falling back to the
    /// per-kind defaults for anything unset. Unknown variables are ignored.
    pub fn from_env(kind: MessageKind) -> Result<Self> {
        let defaults = Self::defaults(kind);
        Ok(Self {
            kind,
            db_schema: env_string("POSTBOX_DB_SCHEMA", &defaults.db_schema),
            db_table: env_string("POSTBOX_DB_TABLE", &defaults.db_table),
            message_processing_timeout: env_millis(
                "POSTBOX_MESSAGE_PROCESSING_TIMEOUT_MS",
                defaults.message_processing_timeout,
            )?,
            max_attempts: env_parse("POSTBOX_MAX_ATTEMPTS", defaults.max_attempts)?,
            enable_max_attempts_protection: env_parse(
                "POSTBOX_ENABLE_MAX_ATTEMPTS_PROTECTION",
                defaults.enable_max_attempts_protection,
            )?,
            max_poisonous_attempts: env_parse(
                "POSTBOX_MAX_POISONOUS_ATTEMPTS",
                defaults.max_poisonous_attempts,
            )?,
            enable_poisonous_message_protection: env_parse(
                "POSTBOX_ENABLE_POISONOUS_MESSAGE_PROTECTION",
                defaults.enable_poisonous_message_protection,
            )?,
            max_message_not_found_attempts: env_parse(
                "POSTBOX_MAX_MESSAGE_NOT_FOUND_ATTEMPTS",
                defaults.max_message_not_found_attempts,
            )?,
            max_message_not_found_delay: env_millis(
                "POSTBOX_MAX_MESSAGE_NOT_FOUND_DELAY_MS",
                defaults.max_message_not_found_delay,
            )?,
            cleanup: CleanupSettings {
                interval: env_millis(
                    "POSTBOX_MESSAGE_CLEANUP_INTERVAL_MS",
                    defaults.cleanup.interval,
                )?,
                processed_max_age: env_opt_secs(
                    "POSTBOX_MESSAGE_CLEANUP_PROCESSED_IN_SEC",
                    defaults.cleanup.processed_max_age,
                )?,
                abandoned_max_age: env_opt_secs(
                    "POSTBOX_MESSAGE_CLEANUP_ABANDONED_IN_SEC",
                    defaults.cleanup.abandoned_max_age,
                )?,
                all_max_age: env_opt_secs(
                    "POSTBOX_MESSAGE_CLEANUP_ALL_IN_SEC",
                    defaults.cleanup.all_max_age,
                )?,
            },
        })
    }

    /// `schema.table` pair for SQL interpolation. Both identifiers come from
    /// trusted configuration; no escaping is applied.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.db_schema, self.db_table)
    }
}

/// Settings for the logical-replication acquisition strategy
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Publication covering the message table (`publish = 'insert'`)
    pub publication: String,

    /// Logical replication slot using the pgoutput plugin
    pub slot: String,

    /// Wait before restarting the subscription after a failure
    pub restart_delay: Duration,

    /// Wait when the slot is held by another process
    pub restart_delay_slot_in_use: Duration,
}

impl ReplicationSettings {
    pub fn new(publication: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            publication: publication.into(),
            slot: slot.into(),
            restart_delay: Duration::from_millis(250),
            restart_delay_slot_in_use: Duration::from_millis(10_000),
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::new("", "");
        Ok(Self {
            publication: env::var("POSTBOX_DB_PUBLICATION")
                .context("POSTBOX_DB_PUBLICATION must be set")?,
            slot: env::var("POSTBOX_DB_REPLICATION_SLOT")
                .context("POSTBOX_DB_REPLICATION_SLOT must be set")?,
            restart_delay: env_millis("POSTBOX_RESTART_DELAY_MS", defaults.restart_delay)?,
            restart_delay_slot_in_use: env_millis(
                "POSTBOX_RESTART_DELAY_SLOT_IN_USE_MS",
                defaults.restart_delay_slot_in_use,
            )?,
        })
    }
}

/// Settings for the polling acquisition strategy
///
/// There is no in-process lease renewal: a crash mid-handling leaves the row
/// locked until `lock_duration` elapses. Deployments must therefore keep
/// `lock_duration` at or above `message_processing_timeout`.
#[derive(Debug, Clone)]
pub struct PollingSettings {
    /// Schema of the set-returning function
    pub function_schema: String,

    /// Name of the set-returning function selecting and leasing due rows
    pub function_name: String,

    /// Upper bound on the in-flight set, reached after the cold-start ramp
    pub batch_size: u32,

    /// Lease duration the function applies to each selected row
    pub lock_duration: Duration,

    /// Sleep between polls when the queue is empty
    pub polling_interval: Duration,
}

impl PollingSettings {
    pub fn for_kind(kind: MessageKind) -> Self {
        Self {
            function_schema: "public".to_string(),
            function_name: kind.default_next_messages_function().to_string(),
            batch_size: 5,
            lock_duration: Duration::from_millis(5_000),
            polling_interval: Duration::from_millis(500),
        }
    }

    pub fn from_env(kind: MessageKind) -> Result<Self> {
        let defaults = Self::for_kind(kind);
        Ok(Self {
            function_schema: env_string(
                "POSTBOX_NEXT_MESSAGES_FUNCTION_SCHEMA",
                &defaults.function_schema,
            ),
            function_name: env_string(
                "POSTBOX_NEXT_MESSAGES_FUNCTION_NAME",
                &defaults.function_name,
            ),
            batch_size: env_parse("POSTBOX_NEXT_MESSAGES_BATCH_SIZE", defaults.batch_size)?,
            lock_duration: env_millis("POSTBOX_NEXT_MESSAGES_LOCK_MS", defaults.lock_duration)?,
            polling_interval: env_millis(
                "POSTBOX_NEXT_MESSAGES_POLLING_INTERVAL_MS",
                defaults.polling_interval,
            )?,
        })
    }

    /// `schema.function` pair for SQL interpolation; trusted configuration.
    pub fn qualified_function(&self) -> String {
        format!("{}.{}", self.function_schema, self.function_name)
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid value")),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    let ms: u64 = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = env_parse(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

fn env_opt_secs(key: &str, default: Option<Duration>) -> Result<Option<Duration>> {
    match env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be a valid integer"))?;
            Ok((secs > 0).then(|| Duration::from_secs(secs)))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn outbox_and_inbox_differ_in_protections() {
        let outbox = ListenerSettings::outbox();
        assert!(!outbox.enable_max_attempts_protection);
        assert!(!outbox.enable_poisonous_message_protection);
        assert_eq!(outbox.db_table, "outbox");

        let inbox = ListenerSettings::inbox();
        assert!(inbox.enable_max_attempts_protection);
        assert!(inbox.enable_poisonous_message_protection);
        assert_eq!(inbox.db_table, "inbox");
    }

    #[test]
    fn documented_defaults() {
        let settings = ListenerSettings::outbox();
        assert_eq!(settings.message_processing_timeout, Duration::from_millis(15_000));
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.max_poisonous_attempts, 3);
        assert_eq!(settings.max_message_not_found_attempts, 0);
        assert_eq!(settings.max_message_not_found_delay, Duration::from_millis(10));
        assert_eq!(settings.qualified_table(), "public.outbox");

        let polling = PollingSettings::for_kind(MessageKind::Inbox);
        assert_eq!(polling.batch_size, 5);
        assert_eq!(polling.lock_duration, Duration::from_millis(5_000));
        assert_eq!(polling.polling_interval, Duration::from_millis(500));
        assert_eq!(polling.qualified_function(), "public.next_inbox_messages");
    }

    #[test]
    fn cleanup_requires_interval_and_threshold() {
        let mut cleanup = CleanupSettings::default();
        assert!(cleanup.is_enabled());

        cleanup.interval = Duration::ZERO;
        assert!(!cleanup.is_enabled());

        let bare = CleanupSettings {
            interval: Duration::from_secs(60),
            processed_max_age: None,
            abandoned_max_age: None,
            all_max_age: None,
        };
        assert!(!bare.is_enabled());
    }

    #[test]
    #[serial]
    fn database_settings_default_pool_tuning() {
        unsafe {
            env::set_var("DATABASE_URL", "postgres://localhost/postbox");
            env::set_var("POSTBOX_DB_ACQUIRE_TIMEOUT_SECS", "3");
        }

        let database = DatabaseSettings::from_env().expect("database settings");
        assert_eq!(database.max_connections, 10);
        assert_eq!(database.acquire_timeout, Duration::from_secs(3));
        assert_eq!(database.idle_timeout, Duration::from_secs(300));
        assert_eq!(database.max_lifetime, Duration::from_secs(1800));

        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("POSTBOX_DB_ACQUIRE_TIMEOUT_SECS");
        }
    }

    #[test]
    #[serial]
    fn env_overlays_defaults() {
        unsafe {
            env::set_var("POSTBOX_DB_TABLE", "events_outbox");
            env::set_var("POSTBOX_MAX_ATTEMPTS", "7");
            env::set_var("POSTBOX_MESSAGE_CLEANUP_PROCESSED_IN_SEC", "0");
        }

        let settings = ListenerSettings::from_env(MessageKind::Outbox).expect("settings");
        assert_eq!(settings.db_table, "events_outbox");
        assert_eq!(settings.max_attempts, 7);
        assert_eq!(settings.cleanup.processed_max_age, None);

        unsafe {
            env::remove_var("POSTBOX_DB_TABLE");
            env::remove_var("POSTBOX_MAX_ATTEMPTS");
            env::remove_var("POSTBOX_MESSAGE_CLEANUP_PROCESSED_IN_SEC");
        }
    }
}

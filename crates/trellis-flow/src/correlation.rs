//! Correlation of asynchronous speaker responses and timeouts back to the
//! pending step that issued them.
//!
//! Each router instance is owned by exactly one worker, so no internal
//! locking is needed; the worker's single-threaded event loop is the
//! serialization point.
//!
//! Guarantees:
//!
//! - At most one open registration per key; registering over a still-open
//!   key is a caller bug and fails loudly
//! - Delivery or timeout for an unknown key is reported to the caller,
//!   which logs and drops it (duplicate or late messages)
//! - A timeout is synthesized at most once per registration

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use trellis_core::{CommandId, OperationId};

use crate::error::{Error, Result};

/// Composite correlation key: one outstanding slot per command per
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Command awaiting a response.
    pub command_id: CommandId,
    /// Operation that issued the command.
    pub operation_id: OperationId,
}

impl CorrelationKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(command_id: CommandId, operation_id: OperationId) -> Self {
        Self {
            command_id,
            operation_id,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.operation_id, self.command_id)
    }
}

/// Routes responses and timeout events back to pending steps.
#[derive(Debug, Default)]
pub struct CorrelationRouter {
    open: HashMap<CorrelationKey, DateTime<Utc>>,
}

impl CorrelationRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending response slot with its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the key is still open.
    pub fn register(&mut self, key: CorrelationKey, deadline: DateTime<Utc>) -> Result<()> {
        if self.open.contains_key(&key) {
            return Err(Error::DuplicateRegistration {
                key: key.to_string(),
            });
        }
        self.open.insert(key, deadline);
        Ok(())
    }

    /// Consumes the registration for a delivered response.
    ///
    /// Returns false when the key is unknown (late or duplicate message);
    /// the caller logs and drops the payload.
    pub fn consume(&mut self, key: &CorrelationKey) -> bool {
        self.open.remove(key).is_some()
    }

    /// Consumes every registration whose deadline has passed.
    ///
    /// Each returned key has been removed, so a late tick for an
    /// already-fired key is a no-op.
    pub fn fire_timeouts(&mut self, now: DateTime<Utc>) -> Vec<CorrelationKey> {
        let mut expired: Vec<CorrelationKey> = self
            .open
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        expired.sort_by_key(|k| (k.operation_id.as_ulid(), k.command_id));
        for key in &expired {
            self.open.remove(key);
        }
        expired
    }

    /// Drops every open registration for an operation.
    ///
    /// Called when the operation reaches a terminal state so stray
    /// responses cannot re-enter it.
    pub fn cancel_operation(&mut self, operation_id: OperationId) {
        self.open.retain(|key, _| key.operation_id != operation_id);
    }

    /// Number of open registrations.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

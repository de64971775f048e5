//! Delivery metadata available to message handlers.

use time::OffsetDateTime;
use uuid::Uuid;

/// Context provided to [`MessageHandler::invoke`](super::MessageHandler::invoke).
///
/// Use [`attempt()`](Self::attempt) as the slot when recording a failure on
/// the command with
/// [`CommandStore::add_command_exception`](crate::CommandStore::add_command_exception):
/// slots are write-once, so a redelivered attempt cannot overwrite the record
/// of the attempt that actually ran first.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Queue entry being processed. Changes on every retry.
    pub delivery_id: Uuid,

    /// Fully-qualified class of the target.
    pub class: String,

    /// Retries before this delivery (0 on the first delivery).
    pub retries: u32,

    /// When this delivery was enqueued.
    pub enqueued_at: OffsetDateTime,
}

impl DispatchContext {
    pub fn new(
        delivery_id: Uuid,
        class: impl Into<String>,
        retries: u32,
        enqueued_at: OffsetDateTime,
    ) -> Self {
        Self {
            delivery_id,
            class: class.into(),
            retries,
            enqueued_at,
        }
    }

    /// One-based attempt number of this delivery: 1 on the first delivery,
    /// `retries + 1` afterwards.
    pub fn attempt(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Returns `true` if an earlier delivery of this work failed.
    pub fn is_retry(&self) -> bool {
        self.retries > 0
    }
}

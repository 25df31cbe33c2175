//! The message handler table.
//!
//! Application threads dispatch every polled message through a table
//! keyed by (message number, version class). Registration under version
//! zero makes a handler the fallback for every version.

use std::sync::Arc;

use dashmap::DashMap;
use iclaustron_core::error::IcResult;

use super::apid::{ApidGlobal, NdbMessage};

/// A message handler run on the polling application thread.
pub type MessageHandler =
    Arc<dyn Fn(&NdbMessage, &ApidGlobal) -> IcResult<()> + Send + Sync>;

/// Dispatch table for received messages.
#[derive(Default)]
pub struct MessageHandlerTable {
    handlers: DashMap<(u32, u32), MessageHandler>,
}

impl MessageHandlerTable {
    #[must_use]
    pub fn new() -> MessageHandlerTable {
        MessageHandlerTable::default()
    }

    /// Registers a handler for a message number at a version class;
    /// version zero is the any-version fallback.
    pub fn register(&self, message_number: u32, version: u32, handler: MessageHandler) {
        self.handlers.insert((message_number, version), handler);
    }

    /// Finds the handler for a message: exact version first, then the
    /// fallback.
    #[must_use]
    pub fn lookup(&self, message_number: u32, version: u32) -> Option<MessageHandler> {
        self.handlers
            .get(&(message_number, version))
            .or_else(|| self.handlers.get(&(message_number, 0)))
            .map(|entry| Arc::clone(entry.value()))
    }
}

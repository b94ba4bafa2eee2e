//! Where message status transitions go
//!
//! Sinks are called from the dispatch loops and must not block them: slow
//! work is spawned.

use smsc_core::Message;
use smsc_store::Repository;
use std::sync::Arc;
use tracing::warn;

pub trait StatusSink: Send + Sync + 'static {
    /// Called after every status transition with the updated message
    fn on_status(&self, message: &Message);
}

/// Writes every transition through to the repository
pub struct PersistingSink {
    repository: Arc<dyn Repository>,
}

impl PersistingSink {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }
}

impl StatusSink for PersistingSink {
    fn on_status(&self, message: &Message) {
        let repository = self.repository.clone();
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = repository.upsert_message(&message).await {
                warn!(message_id = %message.id, status = %message.status, error = %e, "Failed to persist message status");
            }
        });
    }
}

/// Forwards to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StatusSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn StatusSink>) {
        self.sinks.push(sink);
    }
}

impl StatusSink for FanoutSink {
    fn on_status(&self, message: &Message) {
        for sink in &self.sinks {
            sink.on_status(message);
        }
    }
}

/// Discards everything
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_status(&self, _message: &Message) {}
}

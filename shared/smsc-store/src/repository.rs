//! Repository abstraction over the gateway tables

use async_trait::async_trait;
use smsc_core::{Message, MessageId, OperatorId, OperatorRecord, RoutingRule};

use crate::Result;

/// Storage operations the gateway needs. Reads happen at startup and from
/// the admin surface; writes follow every status transition.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn init_schema(&self) -> Result<()>;

    async fn load_operators(&self) -> Result<Vec<OperatorRecord>>;

    async fn save_operator(&self, operator: &OperatorRecord) -> Result<()>;

    async fn delete_operator(&self, id: &OperatorId) -> Result<()>;

    async fn load_rules(&self) -> Result<Vec<RoutingRule>>;

    async fn save_rule(&self, rule: &RoutingRule) -> Result<()>;

    async fn delete_rule(&self, id: &str) -> Result<()>;

    /// Insert or replace the full message record
    async fn upsert_message(&self, message: &Message) -> Result<()>;

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// One page of stored messages, newest first
    async fn list_messages(&self, offset: usize, limit: usize) -> Result<Vec<Message>>;

    async fn is_healthy(&self) -> bool;
}

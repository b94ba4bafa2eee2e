//! In-memory repository

use async_trait::async_trait;
use dashmap::DashMap;
use smsc_core::{Message, MessageId, OperatorId, OperatorRecord, RoutingRule};

use crate::{Repository, Result};

/// Repository backed by concurrent maps. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRepository {
    operators: DashMap<OperatorId, OperatorRecord>,
    rules: DashMap<String, RoutingRule>,
    messages: DashMap<MessageId, Message>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load_operators(&self) -> Result<Vec<OperatorRecord>> {
        let mut operators: Vec<OperatorRecord> =
            self.operators.iter().map(|e| e.value().clone()).collect();
        operators.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(operators)
    }

    async fn save_operator(&self, operator: &OperatorRecord) -> Result<()> {
        self.operators.insert(operator.id.clone(), operator.clone());
        Ok(())
    }

    async fn delete_operator(&self, id: &OperatorId) -> Result<()> {
        self.operators.remove(id);
        self.rules.retain(|_, rule| &rule.operator_id != id);
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        let mut rules: Vec<RoutingRule> = self.rules.iter().map(|e| e.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn save_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.remove(id);
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<()> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.value().clone()))
    }

    async fn list_messages(&self, offset: usize, limit: usize) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self.messages.iter().map(|m| m.value().clone()).collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

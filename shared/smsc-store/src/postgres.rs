//! PostgreSQL repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smsc_core::{
    Address, Message, MessageId, MessageStatus, OperatorId, OperatorRecord, OperatorStatus,
    OptionalParam, Origin, Priority, RoutingRule, TransportBinding,
};
use tokio_postgres::Row;
use tracing::{debug, instrument};

use crate::{schema, Repository, Result, StoreError, StorePool};

pub struct PgRepository {
    pool: StorePool,
}

impl PgRepository {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }
}

fn to_u8(value: i16, column: &str) -> Result<u8> {
    u8::try_from(value).map_err(|_| StoreError::Decode(format!("{} out of range: {}", column, value)))
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("{} out of range: {}", column, value)))
}

fn operator_from_row(row: &Row) -> Result<OperatorRecord> {
    let status: String = row.try_get("status")?;
    let transport: serde_json::Value = row.try_get("transport")?;
    Ok(OperatorRecord {
        id: OperatorId::new(row.try_get::<_, String>("id")?),
        name: row.try_get("name")?,
        priority: to_u32(row.try_get("priority")?, "priority")?,
        weight: to_u32(row.try_get("weight")?, "weight")?,
        max_tps: to_u32(row.try_get("max_tps")?, "max_tps")?,
        status: match status.as_str() {
            "disabled" => OperatorStatus::Disabled,
            _ => OperatorStatus::Active,
        },
        transport: serde_json::from_value::<TransportBinding>(transport)?,
    })
}

fn rule_from_row(row: &Row) -> Result<RoutingRule> {
    let weight: Option<i32> = row.try_get("weight")?;
    Ok(RoutingRule {
        id: row.try_get("id")?,
        pattern: row.try_get("pattern")?,
        operator_id: OperatorId::new(row.try_get::<_, String>("operator_id")?),
        priority: to_u32(row.try_get("priority")?, "priority")?,
        weight: weight.map(|w| to_u32(w, "weight")).transpose()?,
    })
}

fn message_from_row(row: &Row) -> Result<Message> {
    let origin: String = row.try_get("origin")?;
    let status: String = row.try_get("status")?;
    let params: serde_json::Value = row.try_get("optional_params")?;
    let validity: i64 = row.try_get("validity_secs")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let operator_id: Option<String> = row.try_get("operator_id")?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        origin: if origin == "sigtran" {
            Origin::Sigtran
        } else {
            Origin::Smpp
        },
        client_id: row.try_get("client_id")?,
        source: Address::new(
            to_u8(row.try_get("sender_ton")?, "sender_ton")?,
            to_u8(row.try_get("sender_npi")?, "sender_npi")?,
            row.try_get::<_, String>("sender")?,
        ),
        destination: Address::new(
            to_u8(row.try_get("recipient_ton")?, "recipient_ton")?,
            to_u8(row.try_get("recipient_npi")?, "recipient_npi")?,
            row.try_get::<_, String>("recipient")?,
        ),
        content: row.try_get("content")?,
        data_coding: to_u8(row.try_get("data_coding")?, "data_coding")?,
        esm_class: to_u8(row.try_get("esm_class")?, "esm_class")?,
        protocol_id: to_u8(row.try_get("protocol_id")?, "protocol_id")?,
        service_type: row.try_get("service_type")?,
        registered_delivery: to_u8(row.try_get("registered_delivery")?, "registered_delivery")?,
        priority: Priority::from_flag(to_u8(row.try_get("priority")?, "priority")?),
        validity_secs: u64::try_from(validity)
            .map_err(|_| StoreError::Decode(format!("validity_secs out of range: {}", validity)))?,
        scheduled_at: row.try_get::<_, Option<DateTime<Utc>>>("scheduled_at")?,
        status: status.parse::<MessageStatus>().map_err(StoreError::Decode)?,
        retry_count: to_u32(retry_count, "retry_count")?,
        last_error: row.try_get("last_error")?,
        operator_id: operator_id.map(OperatorId),
        optional_params: serde_json::from_value::<Vec<OptionalParam>>(params)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        sent_at: row.try_get("sent_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(schema::SCHEMA).await?;
        debug!("Schema ensured");
        Ok(())
    }

    async fn load_operators(&self) -> Result<Vec<OperatorRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, name, priority, weight, max_tps, status, transport FROM operators ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(operator_from_row).collect()
    }

    #[instrument(skip(self, operator), fields(operator = %operator.id))]
    async fn save_operator(&self, operator: &OperatorRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        let transport = serde_json::to_value(&operator.transport)?;
        conn.execute(
            "INSERT INTO operators (id, name, priority, weight, max_tps, status, transport)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name, priority = EXCLUDED.priority, weight = EXCLUDED.weight,
                max_tps = EXCLUDED.max_tps, status = EXCLUDED.status, transport = EXCLUDED.transport",
            &[
                &operator.id.as_str(),
                &operator.name,
                &(operator.priority as i32),
                &(operator.weight as i32),
                &(operator.max_tps as i32),
                &operator.status.as_str(),
                &transport,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_operator(&self, id: &OperatorId) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute("DELETE FROM operators WHERE id = $1", &[&id.as_str()])
            .await?;
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, pattern, operator_id, priority, weight FROM routing_rules ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn save_rule(&self, rule: &RoutingRule) -> Result<()> {
        let conn = self.pool.get().await?;
        let weight = rule.weight.map(|w| w as i32);
        conn.execute(
            "INSERT INTO routing_rules (id, pattern, operator_id, priority, weight)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                pattern = EXCLUDED.pattern, operator_id = EXCLUDED.operator_id,
                priority = EXCLUDED.priority, weight = EXCLUDED.weight",
            &[
                &rule.id,
                &rule.pattern,
                &rule.operator_id.as_str(),
                &(rule.priority as i32),
                &weight,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute("DELETE FROM routing_rules WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, status = %message.status))]
    async fn upsert_message(&self, message: &Message) -> Result<()> {
        let conn = self.pool.get().await?;
        let params = serde_json::to_value(&message.optional_params)?;
        let origin = match message.origin {
            Origin::Smpp => "smpp",
            Origin::Sigtran => "sigtran",
        };
        let operator_id = message.operator_id.as_ref().map(|o| o.as_str());
        conn.execute(
            "INSERT INTO messages (
                id, origin, client_id, sender, sender_ton, sender_npi,
                recipient, recipient_ton, recipient_npi, content, data_coding, esm_class,
                protocol_id, service_type, registered_delivery, priority, validity_secs,
                scheduled_at, status, retry_count, last_error, operator_id, optional_params,
                created_at, updated_at, sent_at, delivered_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status, retry_count = EXCLUDED.retry_count,
                last_error = EXCLUDED.last_error, operator_id = EXCLUDED.operator_id,
                updated_at = EXCLUDED.updated_at, sent_at = EXCLUDED.sent_at,
                delivered_at = EXCLUDED.delivered_at",
            &[
                &message.id.as_str(),
                &origin,
                &message.client_id,
                &message.source.digits,
                &(message.source.ton as i16),
                &(message.source.npi as i16),
                &message.destination.digits,
                &(message.destination.ton as i16),
                &(message.destination.npi as i16),
                &message.content,
                &(message.data_coding as i16),
                &(message.esm_class as i16),
                &(message.protocol_id as i16),
                &message.service_type,
                &(message.registered_delivery as i16),
                &(message.priority.as_flag() as i16),
                &(message.validity_secs.min(i64::MAX as u64) as i64),
                &message.scheduled_at,
                &message.status.as_str(),
                &(message.retry_count as i32),
                &message.last_error,
                &operator_id,
                &params,
                &message.created_at,
                &message.updated_at,
                &message.sent_at,
                &message.delivered_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt("SELECT * FROM messages WHERE id = $1", &[&id.as_str()])
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(&self, offset: usize, limit: usize) -> Result<Vec<Message>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT * FROM messages ORDER BY created_at DESC, id LIMIT $1 OFFSET $2",
                &[
                    &(limit.min(i64::MAX as usize) as i64),
                    &(offset.min(i64::MAX as usize) as i64),
                ],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn is_healthy(&self) -> bool {
        self.pool.is_healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_checks() {
        assert_eq!(to_u8(5, "x").unwrap(), 5);
        assert!(matches!(to_u8(-1, "x"), Err(StoreError::Decode(_))));
        assert!(matches!(to_u32(-7, "x"), Err(StoreError::Decode(_))));
    }
}

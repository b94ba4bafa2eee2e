//! Table definitions

/// Idempotent DDL for the three gateway tables
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS operators (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 1,
    weight      INTEGER NOT NULL DEFAULT 100,
    max_tps     INTEGER NOT NULL,
    status      TEXT NOT NULL DEFAULT 'active',
    transport   JSONB NOT NULL DEFAULT '{"kind":"none"}'
);

CREATE TABLE IF NOT EXISTS routing_rules (
    id          TEXT PRIMARY KEY,
    pattern     TEXT NOT NULL,
    operator_id TEXT NOT NULL REFERENCES operators(id) ON DELETE CASCADE,
    priority    INTEGER NOT NULL DEFAULT 1,
    weight      INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY,
    origin              TEXT NOT NULL,
    client_id           TEXT,
    sender              TEXT NOT NULL,
    sender_ton          SMALLINT NOT NULL,
    sender_npi          SMALLINT NOT NULL,
    recipient           TEXT NOT NULL,
    recipient_ton       SMALLINT NOT NULL,
    recipient_npi       SMALLINT NOT NULL,
    content             BYTEA NOT NULL,
    data_coding         SMALLINT NOT NULL,
    esm_class           SMALLINT NOT NULL,
    protocol_id         SMALLINT NOT NULL,
    service_type        TEXT NOT NULL,
    registered_delivery SMALLINT NOT NULL,
    priority            SMALLINT NOT NULL,
    validity_secs       BIGINT NOT NULL,
    scheduled_at        TIMESTAMPTZ,
    status              TEXT NOT NULL,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT,
    operator_id         TEXT,
    optional_params     JSONB NOT NULL DEFAULT '[]',
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    sent_at             TIMESTAMPTZ,
    delivered_at        TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS messages_status_idx ON messages (status);
CREATE INDEX IF NOT EXISTS messages_created_idx ON messages (created_at DESC);
"#;

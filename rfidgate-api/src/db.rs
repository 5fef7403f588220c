//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling with deadpool-postgres, and `PgStore`, the
//! relational implementation of the storage traits.
//!
//! Every race-deciding write is one statement: plain INSERT against a unique
//! constraint, or an UPDATE whose WHERE clause carries the precondition and
//! whose affected-row count is the answer. The one exception is the edge
//! event append, which pairs the event INSERT with the batch state
//! compare-and-set in a single transaction. Unique violations are reported as
//! `StorageError::DuplicateKey` with the constraint names the pipeline
//! matches on.

use crate::error::{ApiError, ApiResult};
use ::async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use rfidgate_core::{
    AgentCompletion, AgentRequest, AgentRequestStatus, AntennaRule, BatchState, BatchStatus,
    BusinessDocument, ClaimStatus, DeliverySettings, DocStatus, DocumentDraft, DocumentKind,
    EdgeEvent, EntityType, FulfillmentError, IdempotencyClaim, Item, RfidError, RfidResult,
    SavedTag, SavedTagOrder, StockIssueSettings, StorageError, TagNote, TagStatus, TagUpdate,
    Timestamp, TrackedTag,
};
use rfidgate_storage::{
    append_remark, constraints, DocumentLedger, ItemCatalog, RecordStore, SavedTagDelta,
};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::FromSql;
use tokio_postgres::{NoTls, Row};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait/create timeout for pool checkouts
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "rfidgate".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from `RFIDGATE_DB_*` variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("RFIDGATE_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("RFIDGATE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("RFIDGATE_DB_NAME").unwrap_or_else(|_| "rfidgate".to_string()),
            user: std::env::var("RFIDGATE_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("RFIDGATE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("RFIDGATE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("RFIDGATE_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        pool_cfg.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Idempotent DDL for every table the store touches. Constraint names are
/// mapped back to `rfidgate_storage::constraints` in [`constraint_key`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rfid_edge_event (
    event_id      TEXT        NOT NULL,
    device_id     TEXT        NOT NULL,
    batch_id      TEXT,
    seq           BIGINT,
    event_type    TEXT        NOT NULL,
    payload       JSONB       NOT NULL,
    payload_hash  TEXT        NOT NULL,
    received_at   TIMESTAMPTZ NOT NULL,
    CONSTRAINT rfid_edge_event_pkey PRIMARY KEY (event_id),
    CONSTRAINT rfid_edge_event_position_key UNIQUE (device_id, batch_id, seq)
);

CREATE TABLE IF NOT EXISTS rfid_batch_state (
    device_id         TEXT        NOT NULL PRIMARY KEY,
    status            TEXT        NOT NULL,
    current_batch_id  TEXT,
    current_product   TEXT,
    pending_product   TEXT,
    pause_reason      TEXT,
    last_event_seq    BIGINT      NOT NULL DEFAULT -1,
    last_seen_at      TIMESTAMPTZ,
    config            JSONB,
    version           BIGINT      NOT NULL
);

CREATE TABLE IF NOT EXISTS rfid_idempotency_claim (
    claim_key       TEXT        NOT NULL,
    raw_key         TEXT        NOT NULL,
    kind            TEXT        NOT NULL,
    status          TEXT        NOT NULL,
    owner_doc_type  TEXT,
    owner_doc_name  TEXT,
    payload_hash    TEXT        NOT NULL,
    epc             TEXT,
    claimed_at      TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    last_error      TEXT,
    CONSTRAINT rfid_idempotency_claim_pkey PRIMARY KEY (claim_key)
);

CREATE TABLE IF NOT EXISTS rfid_antenna_rule (
    device                TEXT     NOT NULL,
    antenna_id            SMALLINT NOT NULL,
    submit_stock          BOOLEAN  NOT NULL DEFAULT FALSE,
    create_delivery_note  BOOLEAN  NOT NULL DEFAULT FALSE,
    submit_delivery_note  BOOLEAN  NOT NULL DEFAULT FALSE,
    PRIMARY KEY (device, antenna_id)
);

CREATE TABLE IF NOT EXISTS rfid_tag (
    epc                    TEXT             NOT NULL,
    item_code              TEXT             NOT NULL,
    item_name              TEXT,
    qty                    DOUBLE PRECISION NOT NULL,
    uom                    TEXT             NOT NULL,
    consume_antenna_id     SMALLINT         NOT NULL DEFAULT 0,
    status                 TEXT             NOT NULL,
    client_request_id      TEXT,
    requested_by           TEXT,
    printed_at             TIMESTAMPTZ,
    scan_recon_required    BOOLEAN          NOT NULL DEFAULT FALSE,
    owner_stock_doc        TEXT,
    owner_delivery_doc     TEXT,
    delivery_submitted_at  TIMESTAMPTZ,
    delivery_device        TEXT,
    consumed_at            TIMESTAMPTZ,
    consumed_device        TEXT,
    last_error             TEXT,
    last_event_id          TEXT,
    last_batch_id          TEXT,
    last_seq               BIGINT,
    last_device_id         TEXT,
    created_at             TIMESTAMPTZ      NOT NULL,
    modified_at            TIMESTAMPTZ      NOT NULL,
    CONSTRAINT rfid_tag_pkey PRIMARY KEY (epc),
    CONSTRAINT rfid_tag_client_request_id_key UNIQUE (client_request_id)
);
CREATE INDEX IF NOT EXISTS rfid_tag_status_modified_idx ON rfid_tag (status, modified_at DESC);
CREATE INDEX IF NOT EXISTS rfid_tag_modified_idx ON rfid_tag (modified_at DESC);

CREATE TABLE IF NOT EXISTS rfid_agent_request (
    request_id        TEXT        NOT NULL,
    agent_id          TEXT        NOT NULL,
    command           TEXT        NOT NULL,
    args              JSONB       NOT NULL,
    requested_by      TEXT,
    status            TEXT        NOT NULL,
    timeout_sec       BIGINT      NOT NULL,
    lease_expires_at  TIMESTAMPTZ,
    result            JSONB,
    error             TEXT,
    request_ts        TIMESTAMPTZ NOT NULL,
    sent_at           TIMESTAMPTZ,
    replied_at        TIMESTAMPTZ,
    CONSTRAINT rfid_agent_request_pkey PRIMARY KEY (request_id)
);
CREATE INDEX IF NOT EXISTS rfid_agent_request_poll_idx
    ON rfid_agent_request (agent_id, status, request_ts);

CREATE TABLE IF NOT EXISTS rfid_saved_tag (
    epc        TEXT        NOT NULL PRIMARY KEY,
    reads      BIGINT      NOT NULL,
    last_seen  TIMESTAMPTZ NOT NULL,
    device     TEXT        NOT NULL
);

CREATE TABLE IF NOT EXISTS rfid_saved_tag_day (
    epc        TEXT        NOT NULL,
    day        DATE        NOT NULL,
    reads      BIGINT      NOT NULL,
    last_seen  TIMESTAMPTZ NOT NULL,
    device     TEXT        NOT NULL,
    PRIMARY KEY (epc, day)
);

CREATE TABLE IF NOT EXISTS rfid_tag_note (
    epc         TEXT        NOT NULL PRIMARY KEY,
    note        TEXT        NOT NULL,
    device      TEXT        NOT NULL DEFAULT '',
    updated_at  TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS rfid_item (
    item_code  TEXT NOT NULL PRIMARY KEY,
    item_name  TEXT NOT NULL,
    stock_uom  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rfid_uom_conversion (
    item_code          TEXT             NOT NULL,
    uom                TEXT             NOT NULL,
    conversion_factor  DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (item_code, uom)
);

CREATE TABLE IF NOT EXISTS rfid_stock_issue_setting (
    item_code      TEXT NOT NULL PRIMARY KEY,
    company        TEXT NOT NULL,
    warehouse      TEXT NOT NULL,
    naming_series  TEXT
);

CREATE TABLE IF NOT EXISTS rfid_delivery_setting (
    item_code           TEXT             NOT NULL PRIMARY KEY,
    company             TEXT             NOT NULL,
    customer            TEXT             NOT NULL,
    warehouse           TEXT             NOT NULL,
    selling_price_list  TEXT,
    default_rate        DOUBLE PRECISION NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rfid_document_series (
    series   TEXT   NOT NULL PRIMARY KEY,
    counter  BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS rfid_document (
    kind       TEXT     NOT NULL,
    name       TEXT     NOT NULL,
    docstatus  SMALLINT NOT NULL,
    body       JSONB    NOT NULL,
    PRIMARY KEY (kind, name)
);
"#;

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn backend(err: impl fmt::Display) -> RfidError {
    RfidError::Storage(StorageError::Backend {
        reason: err.to_string(),
    })
}

fn not_found(entity_type: EntityType, key: impl Into<String>) -> RfidError {
    RfidError::Storage(StorageError::NotFound {
        entity_type,
        key: key.into(),
    })
}

/// Translate a Postgres constraint name into the name the pipeline matches.
fn constraint_key(name: &str) -> &str {
    match name {
        "rfid_edge_event_pkey" => constraints::EVENT_ID,
        "rfid_edge_event_position_key" => constraints::EVENT_POSITION,
        "rfid_idempotency_claim_pkey" => constraints::CLAIM_KEY,
        "rfid_tag_pkey" => constraints::TAG_EPC,
        "rfid_tag_client_request_id_key" => constraints::TAG_CLIENT_REQUEST,
        "rfid_agent_request_pkey" => constraints::AGENT_REQUEST_ID,
        other => other,
    }
}

fn pg_error(entity_type: EntityType, err: tokio_postgres::Error) -> RfidError {
    if let Some(db) = err.as_db_error() {
        if *db.code() == SqlState::UNIQUE_VIOLATION {
            let constraint = constraint_key(db.constraint().unwrap_or_default()).to_string();
            return RfidError::Storage(StorageError::DuplicateKey {
                entity_type,
                constraint,
                key: db.detail().unwrap_or_default().to_string(),
            });
        }
    }
    tracing::error!(entity_type = %entity_type, error = ?err, "Postgres error");
    backend(err)
}

fn pool_error(err: PoolError) -> RfidError {
    tracing::error!("Connection pool error: {:?}", err);
    backend(err)
}

fn col<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> RfidResult<T> {
    row.try_get(name).map_err(backend)
}

fn antenna(raw: i16) -> RfidResult<u8> {
    u8::try_from(raw).map_err(backend)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const EVENT_COLUMNS: &str =
    "event_id, device_id, batch_id, seq, event_type, payload, payload_hash, received_at";

fn event_from_row(row: &Row) -> RfidResult<EdgeEvent> {
    Ok(EdgeEvent {
        event_id: col(row, "event_id")?,
        device_id: col(row, "device_id")?,
        batch_id: col(row, "batch_id")?,
        seq: col(row, "seq")?,
        event_type: col(row, "event_type")?,
        payload: col(row, "payload")?,
        payload_hash: col(row, "payload_hash")?,
        received_at: col(row, "received_at")?,
    })
}

const STATE_COLUMNS: &str = "device_id, status, current_batch_id, current_product, \
     pending_product, pause_reason, last_event_seq, last_seen_at, config, version";

fn state_from_row(row: &Row) -> RfidResult<BatchState> {
    let status: String = col(row, "status")?;
    Ok(BatchState {
        device_id: col(row, "device_id")?,
        status: BatchStatus::from_db_str(&status).map_err(backend)?,
        current_batch_id: col(row, "current_batch_id")?,
        current_product: col(row, "current_product")?,
        pending_product: col(row, "pending_product")?,
        pause_reason: col(row, "pause_reason")?,
        last_event_seq: col(row, "last_event_seq")?,
        last_seen_at: col(row, "last_seen_at")?,
        config: col(row, "config")?,
        version: col(row, "version")?,
    })
}

const CLAIM_COLUMNS: &str = "claim_key, raw_key, kind, status, owner_doc_type, owner_doc_name, \
     payload_hash, epc, claimed_at, created_at, last_error";

fn claim_from_row(row: &Row) -> RfidResult<IdempotencyClaim> {
    let status: String = col(row, "status")?;
    let owner_doc_type: Option<String> = col(row, "owner_doc_type")?;
    Ok(IdempotencyClaim {
        key: col(row, "claim_key")?,
        raw_key: col(row, "raw_key")?,
        kind: col(row, "kind")?,
        status: ClaimStatus::from_db_str(&status).map_err(backend)?,
        owner_doc_type: owner_doc_type
            .map(|s| DocumentKind::from_db_str(&s))
            .transpose()
            .map_err(backend)?,
        owner_doc_name: col(row, "owner_doc_name")?,
        payload_hash: col(row, "payload_hash")?,
        epc: col(row, "epc")?,
        claimed_at: col(row, "claimed_at")?,
        created_at: col(row, "created_at")?,
        last_error: col(row, "last_error")?,
    })
}

fn rule_from_row(row: &Row) -> RfidResult<AntennaRule> {
    Ok(AntennaRule {
        device: col(row, "device")?,
        antenna_id: antenna(col(row, "antenna_id")?)?,
        submit_stock: col(row, "submit_stock")?,
        create_delivery_note: col(row, "create_delivery_note")?,
        submit_delivery_note: col(row, "submit_delivery_note")?,
    })
}

const TAG_COLUMNS: &str = "epc, item_code, item_name, qty, uom, consume_antenna_id, status, \
     client_request_id, requested_by, printed_at, scan_recon_required, owner_stock_doc, \
     owner_delivery_doc, delivery_submitted_at, delivery_device, consumed_at, consumed_device, \
     last_error, last_event_id, last_batch_id, last_seq, last_device_id, created_at, modified_at";

fn tag_from_row(row: &Row) -> RfidResult<TrackedTag> {
    let status: String = col(row, "status")?;
    Ok(TrackedTag {
        epc: col(row, "epc")?,
        item_code: col(row, "item_code")?,
        item_name: col(row, "item_name")?,
        qty: col(row, "qty")?,
        uom: col(row, "uom")?,
        consume_antenna_id: antenna(col(row, "consume_antenna_id")?)?,
        status: TagStatus::from_db_str(&status).map_err(backend)?,
        client_request_id: col(row, "client_request_id")?,
        requested_by: col(row, "requested_by")?,
        printed_at: col(row, "printed_at")?,
        scan_recon_required: col(row, "scan_recon_required")?,
        owner_stock_doc: col(row, "owner_stock_doc")?,
        owner_delivery_doc: col(row, "owner_delivery_doc")?,
        delivery_submitted_at: col(row, "delivery_submitted_at")?,
        delivery_device: col(row, "delivery_device")?,
        consumed_at: col(row, "consumed_at")?,
        consumed_device: col(row, "consumed_device")?,
        last_error: col(row, "last_error")?,
        last_event_id: col(row, "last_event_id")?,
        last_batch_id: col(row, "last_batch_id")?,
        last_seq: col(row, "last_seq")?,
        last_device_id: col(row, "last_device_id")?,
        created_at: col(row, "created_at")?,
        modified_at: col(row, "modified_at")?,
    })
}

const REQUEST_COLUMNS: &str = "request_id, agent_id, command, args, requested_by, status, \
     timeout_sec, lease_expires_at, result, error, request_ts, sent_at, replied_at";

fn request_from_row(row: &Row) -> RfidResult<AgentRequest> {
    let status: String = col(row, "status")?;
    Ok(AgentRequest {
        request_id: col(row, "request_id")?,
        agent_id: col(row, "agent_id")?,
        command: col(row, "command")?,
        args: col(row, "args")?,
        requested_by: col(row, "requested_by")?,
        status: AgentRequestStatus::from_db_str(&status).map_err(backend)?,
        timeout_sec: col(row, "timeout_sec")?,
        lease_expires_at: col(row, "lease_expires_at")?,
        result: col(row, "result")?,
        error: col(row, "error")?,
        request_ts: col(row, "request_ts")?,
        sent_at: col(row, "sent_at")?,
        replied_at: col(row, "replied_at")?,
    })
}

fn saved_from_row(row: &Row) -> RfidResult<SavedTag> {
    Ok(SavedTag {
        epc: col(row, "epc")?,
        reads: col(row, "reads")?,
        last_seen: col(row, "last_seen")?,
        device: col(row, "device")?,
    })
}

fn note_from_row(row: &Row) -> RfidResult<TagNote> {
    Ok(TagNote {
        epc: col(row, "epc")?,
        note: col(row, "note")?,
        device: col(row, "device")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn delivery_settings_from_row(row: &Row) -> RfidResult<DeliverySettings> {
    Ok(DeliverySettings {
        item_code: col(row, "item_code")?,
        company: col(row, "company")?,
        customer: col(row, "customer")?,
        warehouse: col(row, "warehouse")?,
        selling_price_list: col(row, "selling_price_list")?,
        default_rate: col(row, "default_rate")?,
    })
}

fn document_from_row(row: &Row) -> RfidResult<BusinessDocument> {
    let docstatus: i16 = col(row, "docstatus")?;
    let body: serde_json::Value = col(row, "body")?;
    Ok(BusinessDocument {
        name: col(row, "name")?,
        status: DocStatus::from_i16(docstatus).map_err(backend)?,
        body: serde_json::from_value(body).map_err(backend)?,
    })
}

// ============================================================================
// POSTGRES STORE
// ============================================================================

/// Record store, item catalog and document ledger backed by one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create missing tables and indexes.
    pub async fn ensure_schema(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        tracing::info!("Database schema ready");
        Ok(())
    }

    async fn conn(&self) -> RfidResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }

    /// Compare-and-set on `rfid_batch_state.version` inside `tx`.
    async fn write_state(
        tx: &deadpool_postgres::Transaction<'_>,
        state: &BatchState,
        expected_version: i64,
    ) -> RfidResult<bool> {
        let status = state.status.as_db_str();
        let next_version = expected_version + 1;
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 11] = [
            &state.device_id,
            &status,
            &state.current_batch_id,
            &state.current_product,
            &state.pending_product,
            &state.pause_reason,
            &state.last_event_seq,
            &state.last_seen_at,
            &state.config,
            &next_version,
            &expected_version,
        ];

        let written = if expected_version == 0 {
            tx.execute(
                "INSERT INTO rfid_batch_state \
                 (device_id, status, current_batch_id, current_product, pending_product, \
                  pause_reason, last_event_seq, last_seen_at, config, version) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (device_id) DO NOTHING",
                &params[..10],
            )
            .await
        } else {
            tx.execute(
                "UPDATE rfid_batch_state SET status = $2, current_batch_id = $3, \
                 current_product = $4, pending_product = $5, pause_reason = $6, \
                 last_event_seq = $7, last_seen_at = $8, config = $9, version = $10 \
                 WHERE device_id = $1 AND version = $11",
                &params,
            )
            .await
        }
        .map_err(|e| pg_error(EntityType::BatchState, e))?;

        Ok(written == 1)
    }

    async fn write_tag(
        client: &deadpool_postgres::Transaction<'_>,
        tag: &TrackedTag,
    ) -> RfidResult<()> {
        let status = tag.status.as_db_str();
        let consume_antenna_id = i16::from(tag.consume_antenna_id);
        client
            .execute(
                "UPDATE rfid_tag SET status = $2, printed_at = $3, owner_stock_doc = $4, \
                 owner_delivery_doc = $5, delivery_submitted_at = $6, delivery_device = $7, \
                 consumed_at = $8, consumed_device = $9, last_error = $10, last_event_id = $11, \
                 last_batch_id = $12, last_seq = $13, last_device_id = $14, modified_at = $15, \
                 consume_antenna_id = $16 \
                 WHERE epc = $1",
                &[
                    &tag.epc,
                    &status,
                    &tag.printed_at,
                    &tag.owner_stock_doc,
                    &tag.owner_delivery_doc,
                    &tag.delivery_submitted_at,
                    &tag.delivery_device,
                    &tag.consumed_at,
                    &tag.consumed_device,
                    &tag.last_error,
                    &tag.last_event_id,
                    &tag.last_batch_id,
                    &tag.last_seq,
                    &tag.last_device_id,
                    &tag.modified_at,
                    &consume_antenna_id,
                ],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    // ========================================================================
    // EDGE EVENTS
    // ========================================================================

    async fn edge_event_append(
        &self,
        event: &EdgeEvent,
        state: &BatchState,
        expected_version: i64,
    ) -> RfidResult<bool> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| pg_error(EntityType::EdgeEvent, e))?;

        // State first: a concurrent writer holding the row makes this wait and
        // then miss, so the loser re-reads instead of hitting the position key.
        if !Self::write_state(&tx, state, expected_version).await? {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO rfid_edge_event \
             (event_id, device_id, batch_id, seq, event_type, payload, payload_hash, received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &event.event_id,
                &event.device_id,
                &event.batch_id,
                &event.seq,
                &event.event_type,
                &event.payload,
                &event.payload_hash,
                &event.received_at,
            ],
        )
        .await
        .map_err(|e| pg_error(EntityType::EdgeEvent, e))?;
        tx.commit()
            .await
            .map_err(|e| pg_error(EntityType::EdgeEvent, e))?;
        Ok(true)
    }

    async fn edge_event_get(&self, event_id: &str) -> RfidResult<Option<EdgeEvent>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM rfid_edge_event WHERE event_id = $1", EVENT_COLUMNS),
                &[&event_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::EdgeEvent, e))?;
        row.as_ref().map(event_from_row).transpose()
    }

    // ========================================================================
    // BATCH STATE
    // ========================================================================

    async fn batch_state_get(&self, device_id: &str) -> RfidResult<Option<BatchState>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM rfid_batch_state WHERE device_id = $1", STATE_COLUMNS),
                &[&device_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::BatchState, e))?;
        row.as_ref().map(state_from_row).transpose()
    }

    // ========================================================================
    // IDEMPOTENCY CLAIMS
    // ========================================================================

    async fn claim_insert(&self, claim: &IdempotencyClaim) -> RfidResult<()> {
        let conn = self.conn().await?;
        let status = claim.status.as_db_str();
        let owner_doc_type = claim.owner_doc_type.map(|k| k.as_db_str());
        conn.execute(
            "INSERT INTO rfid_idempotency_claim \
             (claim_key, raw_key, kind, status, owner_doc_type, owner_doc_name, payload_hash, \
              epc, claimed_at, created_at, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &claim.key,
                &claim.raw_key,
                &claim.kind,
                &status,
                &owner_doc_type,
                &claim.owner_doc_name,
                &claim.payload_hash,
                &claim.epc,
                &claim.claimed_at,
                &claim.created_at,
                &claim.last_error,
            ],
        )
        .await
        .map_err(|e| pg_error(EntityType::IdempotencyClaim, e))?;
        Ok(())
    }

    async fn claim_get(&self, key: &str) -> RfidResult<Option<IdempotencyClaim>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM rfid_idempotency_claim WHERE claim_key = $1",
                    CLAIM_COLUMNS
                ),
                &[&key],
            )
            .await
            .map_err(|e| pg_error(EntityType::IdempotencyClaim, e))?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn claim_take_over(
        &self,
        key: &str,
        observed_claimed_at: Timestamp,
        now: Timestamp,
    ) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let claimed = ClaimStatus::Claimed.as_db_str();
        let updated = conn
            .execute(
                "UPDATE rfid_idempotency_claim SET claimed_at = $3, last_error = NULL \
                 WHERE claim_key = $1 AND status = $4 AND claimed_at = $2",
                &[&key, &observed_claimed_at, &now, &claimed],
            )
            .await
            .map_err(|e| pg_error(EntityType::IdempotencyClaim, e))?;
        Ok(updated == 1)
    }

    async fn claim_finish(
        &self,
        key: &str,
        status: ClaimStatus,
        owner_doc_type: DocumentKind,
        owner_doc_name: Option<&str>,
        error: Option<&str>,
    ) -> RfidResult<()> {
        let conn = self.conn().await?;
        let status = status.as_db_str();
        let doc_type = owner_doc_type.as_db_str();
        let updated = conn
            .execute(
                "UPDATE rfid_idempotency_claim \
                 SET status = $2, owner_doc_type = $3, owner_doc_name = $4, last_error = $5 \
                 WHERE claim_key = $1",
                &[&key, &status, &doc_type, &owner_doc_name, &error],
            )
            .await
            .map_err(|e| pg_error(EntityType::IdempotencyClaim, e))?;
        if updated == 0 {
            return Err(not_found(EntityType::IdempotencyClaim, key));
        }
        Ok(())
    }

    async fn claim_release_failed(&self, key: &str) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let failed = ClaimStatus::Failed.as_db_str();
        let deleted = conn
            .execute(
                "DELETE FROM rfid_idempotency_claim WHERE claim_key = $1 AND status = $2",
                &[&key, &failed],
            )
            .await
            .map_err(|e| pg_error(EntityType::IdempotencyClaim, e))?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // ANTENNA RULES
    // ========================================================================

    async fn antenna_rule_list(&self) -> RfidResult<Vec<AntennaRule>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT device, antenna_id, submit_stock, create_delivery_note, \
                 submit_delivery_note FROM rfid_antenna_rule ORDER BY device, antenna_id",
                &[],
            )
            .await
            .map_err(|e| pg_error(EntityType::AntennaRule, e))?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn antenna_rule_upsert(&self, rule: &AntennaRule) -> RfidResult<()> {
        let conn = self.conn().await?;
        let antenna_id = i16::from(rule.antenna_id);
        conn.execute(
            "INSERT INTO rfid_antenna_rule \
             (device, antenna_id, submit_stock, create_delivery_note, submit_delivery_note) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (device, antenna_id) DO UPDATE SET \
             submit_stock = EXCLUDED.submit_stock, \
             create_delivery_note = EXCLUDED.create_delivery_note, \
             submit_delivery_note = EXCLUDED.submit_delivery_note",
            &[
                &rule.device,
                &antenna_id,
                &rule.submit_stock,
                &rule.create_delivery_note,
                &rule.submit_delivery_note,
            ],
        )
        .await
        .map_err(|e| pg_error(EntityType::AntennaRule, e))?;
        Ok(())
    }

    async fn antenna_rule_delete(&self, device: &str, antenna_id: u8) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let antenna_id = i16::from(antenna_id);
        let deleted = conn
            .execute(
                "DELETE FROM rfid_antenna_rule WHERE device = $1 AND antenna_id = $2",
                &[&device, &antenna_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::AntennaRule, e))?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // TRACKED TAGS
    // ========================================================================

    async fn tag_insert(&self, tag: &TrackedTag) -> RfidResult<()> {
        let conn = self.conn().await?;
        let status = tag.status.as_db_str();
        let consume_antenna_id = i16::from(tag.consume_antenna_id);
        conn.execute(
            &format!(
                "INSERT INTO rfid_tag ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                 $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
                TAG_COLUMNS
            ),
            &[
                &tag.epc,
                &tag.item_code,
                &tag.item_name,
                &tag.qty,
                &tag.uom,
                &consume_antenna_id,
                &status,
                &tag.client_request_id,
                &tag.requested_by,
                &tag.printed_at,
                &tag.scan_recon_required,
                &tag.owner_stock_doc,
                &tag.owner_delivery_doc,
                &tag.delivery_submitted_at,
                &tag.delivery_device,
                &tag.consumed_at,
                &tag.consumed_device,
                &tag.last_error,
                &tag.last_event_id,
                &tag.last_batch_id,
                &tag.last_seq,
                &tag.last_device_id,
                &tag.created_at,
                &tag.modified_at,
            ],
        )
        .await
        .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        Ok(())
    }

    async fn tag_get(&self, epc: &str) -> RfidResult<Option<TrackedTag>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM rfid_tag WHERE epc = $1", TAG_COLUMNS),
                &[&epc],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        row.as_ref().map(tag_from_row).transpose()
    }

    async fn tag_find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> RfidResult<Option<TrackedTag>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM rfid_tag WHERE client_request_id = $1", TAG_COLUMNS),
                &[&client_request_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        row.as_ref().map(tag_from_row).transpose()
    }

    async fn tag_get_many(&self, epcs: &[String]) -> RfidResult<Vec<TrackedTag>> {
        if epcs.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!("SELECT {} FROM rfid_tag WHERE epc = ANY($1)", TAG_COLUMNS),
                &[&epcs],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        let mut by_epc: HashMap<String, TrackedTag> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let tag = tag_from_row(row)?;
            by_epc.insert(tag.epc.clone(), tag);
        }
        // Same order as requested
        Ok(epcs.iter().filter_map(|epc| by_epc.get(epc).cloned()).collect())
    }

    async fn tag_update(&self, epc: &str, update: TagUpdate, now: Timestamp) -> RfidResult<()> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        let row = tx
            .query_opt(
                &format!("SELECT {} FROM rfid_tag WHERE epc = $1 FOR UPDATE", TAG_COLUMNS),
                &[&epc],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?
            .ok_or_else(|| not_found(EntityType::TrackedTag, epc))?;
        let mut tag = tag_from_row(&row)?;
        update.apply_to(&mut tag, now);
        Self::write_tag(&tx, &tag).await?;
        tx.commit()
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        Ok(())
    }

    async fn tag_claim_for_processing(
        &self,
        epc: &str,
        now: Timestamp,
        reclaim_ttl_secs: u64,
    ) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let processing = TagStatus::Processing.as_db_str();
        let consumed = TagStatus::Consumed.as_db_str();
        let reclaim = reclaim_ttl_secs > 0;
        let cutoff = now - ChronoDuration::seconds(i64::try_from(reclaim_ttl_secs).unwrap_or(0));
        let updated = conn
            .execute(
                "UPDATE rfid_tag SET status = $3, modified_at = $2 \
                 WHERE epc = $1 AND (status NOT IN ($3, $4) \
                 OR ($5 AND status = $3 AND modified_at < $6))",
                &[&epc, &now, &processing, &consumed, &reclaim, &cutoff],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        Ok(updated == 1)
    }

    async fn tag_list_recent(&self, limit: usize) -> RfidResult<Vec<TrackedTag>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM rfid_tag ORDER BY modified_at DESC LIMIT $1",
                    TAG_COLUMNS
                ),
                &[&limit_param(limit)],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        rows.iter().map(tag_from_row).collect()
    }

    async fn tag_list_by_status(
        &self,
        statuses: &[TagStatus],
        limit: usize,
    ) -> RfidResult<Vec<TrackedTag>> {
        let conn = self.conn().await?;
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_db_str()).collect();
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM rfid_tag WHERE status = ANY($1) \
                     ORDER BY modified_at DESC LIMIT $2",
                    TAG_COLUMNS
                ),
                &[&statuses, &limit_param(limit)],
            )
            .await
            .map_err(|e| pg_error(EntityType::TrackedTag, e))?;
        rows.iter().map(tag_from_row).collect()
    }

    // ========================================================================
    // AGENT REQUESTS
    // ========================================================================

    async fn agent_request_insert(&self, request: &AgentRequest) -> RfidResult<()> {
        let conn = self.conn().await?;
        let status = request.status.as_db_str();
        conn.execute(
            &format!(
                "INSERT INTO rfid_agent_request ({}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                REQUEST_COLUMNS
            ),
            &[
                &request.request_id,
                &request.agent_id,
                &request.command,
                &request.args,
                &request.requested_by,
                &status,
                &request.timeout_sec,
                &request.lease_expires_at,
                &request.result,
                &request.error,
                &request.request_ts,
                &request.sent_at,
                &request.replied_at,
            ],
        )
        .await
        .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        Ok(())
    }

    async fn agent_request_get(&self, request_id: &str) -> RfidResult<Option<AgentRequest>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM rfid_agent_request WHERE request_id = $1",
                    REQUEST_COLUMNS
                ),
                &[&request_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn agent_request_list_pollable(
        &self,
        agent_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> RfidResult<Vec<AgentRequest>> {
        let conn = self.conn().await?;
        let queued = AgentRequestStatus::Queued.as_db_str();
        let sent = AgentRequestStatus::Sent.as_db_str();
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM rfid_agent_request WHERE agent_id = $1 \
                     AND (status = $2 OR (status = $3 AND \
                     (lease_expires_at IS NULL OR lease_expires_at <= $4))) \
                     ORDER BY request_ts, request_id LIMIT $5",
                    REQUEST_COLUMNS
                ),
                &[&agent_id, &queued, &sent, &now, &limit_param(limit)],
            )
            .await
            .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        rows.iter().map(request_from_row).collect()
    }

    async fn agent_request_lease(
        &self,
        request_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let queued = AgentRequestStatus::Queued.as_db_str();
        let sent = AgentRequestStatus::Sent.as_db_str();
        let updated = conn
            .execute(
                "UPDATE rfid_agent_request SET status = $4, sent_at = $2, lease_expires_at = $3 \
                 WHERE request_id = $1 AND (status = $5 OR (status = $4 AND \
                 (lease_expires_at IS NULL OR lease_expires_at <= $2)))",
                &[&request_id, &now, &lease_until, &sent, &queued],
            )
            .await
            .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        Ok(updated == 1)
    }

    async fn agent_request_complete(
        &self,
        request_id: &str,
        completion: &AgentCompletion,
    ) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let status = completion.status.as_db_str();
        let queued = AgentRequestStatus::Queued.as_db_str();
        let sent = AgentRequestStatus::Sent.as_db_str();
        let updated = conn
            .execute(
                "UPDATE rfid_agent_request SET status = $2, result = $3, error = $4, \
                 lease_expires_at = NULL, replied_at = $5 \
                 WHERE request_id = $1 AND status IN ($6, $7)",
                &[
                    &request_id,
                    &status,
                    &completion.result,
                    &completion.error,
                    &completion.replied_at,
                    &queued,
                    &sent,
                ],
            )
            .await
            .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        if updated == 1 {
            return Ok(true);
        }
        let exists = conn
            .query_opt(
                "SELECT 1 FROM rfid_agent_request WHERE request_id = $1",
                &[&request_id],
            )
            .await
            .map_err(|e| pg_error(EntityType::AgentRequest, e))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(not_found(EntityType::AgentRequest, request_id)),
        }
    }

    // ========================================================================
    // SAVED TAGS
    // ========================================================================

    async fn saved_tags_upsert(
        &self,
        deltas: &[SavedTagDelta],
        device: &str,
        now: Timestamp,
    ) -> RfidResult<usize> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| pg_error(EntityType::SavedTag, e))?;
        let day = now.date_naive();
        let mut touched = 0;
        for delta in deltas.iter().filter(|d| !d.epc.is_empty()) {
            tx.execute(
                "INSERT INTO rfid_saved_tag (epc, reads, last_seen, device) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (epc) DO UPDATE SET reads = rfid_saved_tag.reads + EXCLUDED.reads, \
                 last_seen = EXCLUDED.last_seen, device = EXCLUDED.device",
                &[&delta.epc, &delta.reads, &now, &device],
            )
            .await
            .map_err(|e| pg_error(EntityType::SavedTag, e))?;
            tx.execute(
                "INSERT INTO rfid_saved_tag_day (epc, day, reads, last_seen, device) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (epc, day) DO UPDATE SET \
                 reads = rfid_saved_tag_day.reads + EXCLUDED.reads, \
                 last_seen = EXCLUDED.last_seen, device = EXCLUDED.device",
                &[&delta.epc, &day, &delta.reads, &now, &device],
            )
            .await
            .map_err(|e| pg_error(EntityType::SavedTag, e))?;
            touched += 1;
        }
        tx.commit()
            .await
            .map_err(|e| pg_error(EntityType::SavedTag, e))?;
        Ok(touched)
    }

    async fn saved_tags_list(
        &self,
        day: Option<NaiveDate>,
        order: SavedTagOrder,
        limit: usize,
    ) -> RfidResult<Vec<SavedTag>> {
        let conn = self.conn().await?;
        let order_by = match order {
            SavedTagOrder::Last => "last_seen DESC",
            SavedTagOrder::Reads => "reads DESC",
            SavedTagOrder::Epc => "epc ASC",
        };
        let limit = limit_param(limit);
        let rows = match day {
            Some(day) => {
                conn.query(
                    &format!(
                        "SELECT epc, reads, last_seen, device FROM rfid_saved_tag_day \
                         WHERE day = $1 ORDER BY {} LIMIT $2",
                        order_by
                    ),
                    &[&day, &limit],
                )
                .await
            }
            None => {
                conn.query(
                    &format!(
                        "SELECT epc, reads, last_seen, device FROM rfid_saved_tag \
                         ORDER BY {} LIMIT $1",
                        order_by
                    ),
                    &[&limit],
                )
                .await
            }
        }
        .map_err(|e| pg_error(EntityType::SavedTag, e))?;
        rows.iter().map(saved_from_row).collect()
    }

    async fn saved_tags_clear(&self, day: Option<NaiveDate>) -> RfidResult<()> {
        let conn = self.conn().await?;
        match day {
            Some(day) => {
                conn.execute("DELETE FROM rfid_saved_tag_day WHERE day = $1", &[&day])
                    .await
                    .map_err(|e| pg_error(EntityType::SavedTag, e))?;
            }
            None => {
                conn.batch_execute("DELETE FROM rfid_saved_tag_day; DELETE FROM rfid_saved_tag;")
                    .await
                    .map_err(|e| pg_error(EntityType::SavedTag, e))?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // TAG NOTES
    // ========================================================================

    async fn tag_note_upsert(&self, note: &TagNote) -> RfidResult<TagNote> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO rfid_tag_note (epc, note, device, updated_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (epc) DO UPDATE SET note = EXCLUDED.note, \
                 device = CASE WHEN EXCLUDED.device = '' THEN rfid_tag_note.device \
                 ELSE EXCLUDED.device END, \
                 updated_at = EXCLUDED.updated_at \
                 RETURNING epc, note, device, updated_at",
                &[&note.epc, &note.note, &note.device, &note.updated_at],
            )
            .await
            .map_err(|e| pg_error(EntityType::TagNote, e))?;
        note_from_row(&row)
    }

    async fn tag_note_delete(&self, epc: &str) -> RfidResult<bool> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM rfid_tag_note WHERE epc = $1", &[&epc])
            .await
            .map_err(|e| pg_error(EntityType::TagNote, e))?;
        Ok(deleted > 0)
    }

    async fn tag_notes_list(&self, epcs: &[String], limit: usize) -> RfidResult<Vec<TagNote>> {
        let conn = self.conn().await?;
        let limit = limit_param(limit);
        let rows = if epcs.is_empty() {
            conn.query(
                "SELECT epc, note, device, updated_at FROM rfid_tag_note \
                 ORDER BY epc LIMIT $1",
                &[&limit],
            )
            .await
        } else {
            conn.query(
                "SELECT epc, note, device, updated_at FROM rfid_tag_note \
                 WHERE epc = ANY($1) ORDER BY epc LIMIT $2",
                &[&epcs, &limit],
            )
            .await
        }
        .map_err(|e| pg_error(EntityType::TagNote, e))?;
        rows.iter().map(note_from_row).collect()
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    async fn ping(&self) -> RfidResult<()> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await.map_err(backend)?;
        Ok(())
    }
}

// ============================================================================
// ITEM CATALOG
// ============================================================================

#[async_trait]
impl ItemCatalog for PgStore {
    async fn item(&self, item_code: &str) -> RfidResult<Option<Item>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT item_code, item_name, stock_uom FROM rfid_item WHERE item_code = $1",
                &[&item_code],
            )
            .await
            .map_err(|e| pg_error(EntityType::Item, e))?;
        row.map(|row| {
            Ok(Item {
                item_code: col(&row, "item_code")?,
                item_name: col(&row, "item_name")?,
                stock_uom: col(&row, "stock_uom")?,
            })
        })
        .transpose()
    }

    async fn conversion_factor(&self, item_code: &str, uom: &str) -> RfidResult<Option<f64>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT conversion_factor FROM rfid_uom_conversion \
                 WHERE item_code = $1 AND uom = $2",
                &[&item_code, &uom],
            )
            .await
            .map_err(|e| pg_error(EntityType::Item, e))?;
        row.map(|row| col(&row, "conversion_factor")).transpose()
    }

    async fn stock_issue_settings(
        &self,
        item_code: &str,
    ) -> RfidResult<Option<StockIssueSettings>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT item_code, company, warehouse, naming_series \
                 FROM rfid_stock_issue_setting WHERE item_code = $1",
                &[&item_code],
            )
            .await
            .map_err(|e| pg_error(EntityType::Item, e))?;
        row.map(|row| {
            Ok(StockIssueSettings {
                item_code: col(&row, "item_code")?,
                company: col(&row, "company")?,
                warehouse: col(&row, "warehouse")?,
                naming_series: col(&row, "naming_series")?,
            })
        })
        .transpose()
    }

    async fn delivery_settings(&self, item_code: &str) -> RfidResult<Option<DeliverySettings>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT item_code, company, customer, warehouse, selling_price_list, default_rate \
                 FROM rfid_delivery_setting WHERE item_code = $1",
                &[&item_code],
            )
            .await
            .map_err(|e| pg_error(EntityType::Item, e))?;
        row.as_ref().map(delivery_settings_from_row).transpose()
    }

    async fn delivery_settings_list(&self, limit: usize) -> RfidResult<Vec<DeliverySettings>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT item_code, company, customer, warehouse, selling_price_list, default_rate \
                 FROM rfid_delivery_setting ORDER BY item_code LIMIT $1",
                &[&limit_param(limit)],
            )
            .await
            .map_err(|e| pg_error(EntityType::Item, e))?;
        rows.iter().map(delivery_settings_from_row).collect()
    }
}

// ============================================================================
// DOCUMENT LEDGER
// ============================================================================

#[async_trait]
impl DocumentLedger for PgStore {
    async fn insert_draft(&self, draft: DocumentDraft) -> RfidResult<BusinessDocument> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?;
        let series = draft
            .naming_series
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| draft.kind.default_naming_series().to_string());
        let row = tx
            .query_one(
                "INSERT INTO rfid_document_series (series, counter) VALUES ($1, 1) \
                 ON CONFLICT (series) DO UPDATE SET counter = rfid_document_series.counter + 1 \
                 RETURNING counter",
                &[&series],
            )
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?;
        let counter: i64 = col(&row, "counter")?;
        let name = format!("{}{:05}", series, counter);

        let doc = BusinessDocument {
            name,
            status: DocStatus::Draft,
            body: draft,
        };
        let body = serde_json::to_value(&doc.body).map_err(backend)?;
        let kind = doc.body.kind.as_db_str();
        tx.execute(
            "INSERT INTO rfid_document (kind, name, docstatus, body) VALUES ($1, $2, $3, $4)",
            &[&kind, &doc.name, &doc.status.as_i16(), &body],
        )
        .await
        .map_err(|e| pg_error(EntityType::Document, e))?;
        tx.commit()
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?;
        Ok(doc)
    }

    async fn get(&self, kind: DocumentKind, name: &str) -> RfidResult<Option<BusinessDocument>> {
        let conn = self.conn().await?;
        let kind = kind.as_db_str();
        let row = conn
            .query_opt(
                "SELECT name, docstatus, body FROM rfid_document WHERE kind = $1 AND name = $2",
                &[&kind, &name],
            )
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn submit(
        &self,
        kind: DocumentKind,
        name: &str,
        remark: &str,
        posting_at: Timestamp,
    ) -> RfidResult<BusinessDocument> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?;
        let kind_str = kind.as_db_str();
        let row = tx
            .query_opt(
                "SELECT name, docstatus, body FROM rfid_document \
                 WHERE kind = $1 AND name = $2 FOR UPDATE",
                &[&kind_str, &name],
            )
            .await
            .map_err(|e| pg_error(EntityType::Document, e))?
            .ok_or_else(|| FulfillmentError::DocumentMissing {
                name: name.to_string(),
            })?;
        let mut doc = document_from_row(&row)?;

        match doc.status {
            DocStatus::Cancelled => Err(FulfillmentError::DocumentCancelled {
                name: name.to_string(),
            }
            .into()),
            DocStatus::Submitted => Ok(doc),
            DocStatus::Draft => {
                doc.body.posting_at = posting_at;
                doc.body.remarks = append_remark(&doc.body.remarks, remark);
                doc.status = DocStatus::Submitted;
                let body = serde_json::to_value(&doc.body).map_err(backend)?;
                tx.execute(
                    "UPDATE rfid_document SET docstatus = $3, body = $4 \
                     WHERE kind = $1 AND name = $2",
                    &[&kind_str, &name, &doc.status.as_i16(), &body],
                )
                .await
                .map_err(|e| pg_error(EntityType::Document, e))?;
                tx.commit()
                    .await
                    .map_err(|e| pg_error(EntityType::Document, e))?;
                Ok(doc)
            }
        }
    }
}

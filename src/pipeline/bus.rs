//! Durable subject-addressed pub/sub with consumer groups (C1, §4.1).
//!
//! A real deployment points `BUS_URL` at a managed broker; the core here
//! ships a sqlite-backed implementation of the same contract so the
//! pipeline is runnable and testable without one, backing every subsystem
//! with `rusqlite` instead of a network service.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::errors::{BusError, PipelineError};
use crate::pipeline::envelope::{Envelope, Failure};
use crate::pipeline::subjects::groups_for_subject;

/// A leased message handed to a worker. `delivery_id` is the bus's handle
/// used to ack/nack; `envelope.attempt` reflects the current delivery
/// count (§3).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub envelope: Envelope,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish an envelope; fan-out to every group subscribed to its
    /// subject happens atomically with the publish (§4.1: "publishes must
    /// be acknowledged by the broker before being considered durable").
    async fn publish(&self, envelope: &Envelope) -> Result<(), PipelineError>;

    /// Claim the next eligible message for `(subject, group)`, if any.
    /// Ordering within a `(subject, correlationId)` pair is preserved per
    /// group: a correlation with an in-flight delivery is skipped (§5).
    async fn poll(
        &self,
        subject: &str,
        group: &str,
        ack_wait: Duration,
    ) -> Result<Option<Delivery>, PipelineError>;

    /// Positively acknowledge a delivery.
    async fn ack(&self, delivery_id: i64) -> Result<(), PipelineError>;

    /// Negative-ack; returns the delivery count after this attempt so the
    /// caller can compare against `maxDeliveries`.
    async fn nack(&self, delivery_id: i64) -> Result<u32, PipelineError>;

    /// Route the original envelope to `dlq.<subject>` with a failure
    /// annotation, then ack the originating delivery (§4.1, §7).
    async fn dead_letter(
        &self,
        delivery_id: i64,
        envelope: &Envelope,
        failure: Failure,
    ) -> Result<(), PipelineError>;
}

pub struct SqliteBus {
    conn: Arc<Mutex<Connection>>,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl SqliteBus {
    /// Backoff per §7: base=2s, max=60s.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SqliteBus { conn, backoff_base_ms: 2_000, backoff_max_ms: 60_000 }
    }

    /// Same bus with a caller-chosen backoff, so tests don't have to wait
    /// out real minutes to observe redelivery.
    pub fn with_backoff(conn: Arc<Mutex<Connection>>, backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
        SqliteBus { conn, backoff_base_ms, backoff_max_ms }
    }

    /// Exponential backoff applied to nack'd redelivery: doubling per
    /// failed attempt, capped at `backoff_max_ms`.
    fn backoff_delay(&self, attempts_so_far: u32) -> chrono::Duration {
        let exponent = attempts_so_far.saturating_sub(1).min(20);
        let delay_ms = self.backoff_base_ms.saturating_mul(1u64 << exponent).min(self.backoff_max_ms);
        chrono::Duration::milliseconds(delay_ms as i64)
    }

    pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS bus_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,
                message_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                causation_id TEXT,
                occurred_at TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                schema_version TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bus_messages_subject ON bus_messages(subject, id);

            CREATE TABLE IF NOT EXISTS bus_deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_row_id INTEGER NOT NULL REFERENCES bus_messages(id),
                subject TEXT NOT NULL,
                group_name TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                lease_expires_at TEXT,
                UNIQUE(message_row_id, group_name)
            );
            CREATE INDEX IF NOT EXISTS idx_bus_deliveries_poll
                ON bus_deliveries(subject, group_name, status);
            ",
        )
    }

    fn row_to_envelope(row: &rusqlite::Row, attempt: u32) -> rusqlite::Result<Envelope> {
        let payload_text: String = row.get("payload")?;
        let payload: serde_json::Value = serde_json::from_str(&payload_text)
            .unwrap_or(serde_json::Value::Null);
        Ok(Envelope {
            message_id: row.get("message_id")?,
            correlation_id: row.get("correlation_id")?,
            causation_id: row.get("causation_id")?,
            occurred_at: row.get("occurred_at")?,
            attempt,
            subject: row.get("subject")?,
            tenant_id: row.get("tenant_id")?,
            schema_version: row.get("schema_version")?,
            payload,
        })
    }
}

#[async_trait]
impl Bus for SqliteBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        const MAX_PAYLOAD: usize = crate::config::MAX_PAYLOAD_BYTES as usize;
        let payload_text = serde_json::to_string(&envelope.payload)
            .map_err(|e| BusError::PublishRejected(format!("payload serialization failed: {}", e)))?;
        if payload_text.len() > MAX_PAYLOAD {
            return Err(BusError::PublishRejected(format!(
                "envelope exceeds maxPayload ({} > {})",
                payload_text.len(),
                MAX_PAYLOAD
            ))
            .into());
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bus_messages
                (subject, message_id, correlation_id, causation_id, occurred_at, tenant_id, schema_version, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                envelope.subject,
                envelope.message_id,
                envelope.correlation_id,
                envelope.causation_id,
                envelope.occurred_at.to_rfc3339(),
                envelope.tenant_id,
                envelope.schema_version,
                payload_text,
            ],
        )
        .map_err(|e| BusError::Unreachable(e.to_string()))?;
        let message_row_id = conn.last_insert_rowid();

        for group in groups_for_subject(&envelope.subject) {
            conn.execute(
                "INSERT INTO bus_deliveries
                    (message_row_id, subject, group_name, correlation_id, attempt, status, lease_expires_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 'pending', NULL)",
                params![message_row_id, envelope.subject, group, envelope.correlation_id],
            )
            .map_err(|e| BusError::Unreachable(e.to_string()))?;
        }
        Ok(())
    }

    async fn poll(
        &self,
        subject: &str,
        group: &str,
        ack_wait: Duration,
    ) -> Result<Option<Delivery>, PipelineError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        conn.execute(
            "UPDATE bus_deliveries SET status = 'pending', lease_expires_at = NULL
             WHERE subject = ?1 AND group_name = ?2 AND status = 'leased' AND lease_expires_at < ?3",
            params![subject, group, now.to_rfc3339()],
        )
        .map_err(|e| BusError::Unreachable(e.to_string()))?;

        let candidate: Option<(i64, i64, u32)> = conn
            .query_row(
                "SELECT d.id, d.message_row_id, d.attempt FROM bus_deliveries d
                 WHERE d.subject = ?1 AND d.group_name = ?2 AND d.status = 'pending'
                   AND (d.lease_expires_at IS NULL OR d.lease_expires_at <= ?3)
                   AND NOT EXISTS (
                       SELECT 1 FROM bus_deliveries d2
                       WHERE d2.subject = d.subject AND d2.group_name = d.group_name
                         AND d2.correlation_id = d.correlation_id AND d2.status = 'leased'
                   )
                 ORDER BY d.id ASC LIMIT 1",
                params![subject, group, now.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        let Some((delivery_id, message_row_id, attempt)) = candidate else {
            return Ok(None);
        };

        let lease_expires_at = now + chrono::Duration::from_std(ack_wait).unwrap_or(chrono::Duration::seconds(30));
        let updated = conn
            .execute(
                "UPDATE bus_deliveries SET status = 'leased', lease_expires_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![lease_expires_at.to_rfc3339(), delivery_id],
            )
            .map_err(|e| BusError::Unreachable(e.to_string()))?;
        if updated == 0 {
            // Lost the race to claim this delivery; caller will poll again.
            return Ok(None);
        }

        let envelope = conn
            .query_row(
                "SELECT * FROM bus_messages WHERE id = ?1",
                params![message_row_id],
                |row| Self::row_to_envelope(row, attempt),
            )
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        Ok(Some(Delivery { delivery_id, envelope }))
    }

    async fn ack(&self, delivery_id: i64) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE bus_deliveries SET status = 'acked', lease_expires_at = NULL WHERE id = ?1",
            params![delivery_id],
        )
        .map_err(|e| BusError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, delivery_id: i64) -> Result<u32, PipelineError> {
        let conn = self.conn.lock().await;
        let attempt: u32 = conn
            .query_row(
                "SELECT attempt FROM bus_deliveries WHERE id = ?1",
                params![delivery_id],
                |row| row.get(0),
            )
            .map_err(|e| BusError::Unreachable(e.to_string()))?;

        // `lease_expires_at` does double duty: while leased it's the ack
        // deadline, while pending after a nack it's the earliest time this
        // delivery becomes pollable again (backoff_delay above).
        let available_at = Utc::now() + self.backoff_delay(attempt);
        conn.execute(
            "UPDATE bus_deliveries SET status = 'pending', lease_expires_at = ?1, attempt = attempt + 1
             WHERE id = ?2",
            params![available_at.to_rfc3339(), delivery_id],
        )
        .map_err(|e| BusError::Unreachable(e.to_string()))?;
        Ok(attempt + 1)
    }

    async fn dead_letter(
        &self,
        delivery_id: i64,
        envelope: &Envelope,
        failure: Failure,
    ) -> Result<(), PipelineError> {
        let dlq = crate::pipeline::subjects::dlq_subject(&envelope.subject);
        let dead_letter = crate::pipeline::envelope::DeadLetter {
            original: envelope.clone(),
            failure,
        };
        let payload = serde_json::to_value(&dead_letter)
            .map_err(|e| BusError::PublishRejected(e.to_string()))?;
        let dlq_envelope = Envelope::new(
            dlq,
            envelope.correlation_id.clone(),
            envelope.tenant_id.clone(),
            Some(envelope.message_id.clone()),
            payload,
        );
        self.publish(&dlq_envelope).await?;
        self.ack(delivery_id).await
    }
}

//! The transport wrapper carried on every bus message (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Every bus message is wrapped in an `Envelope`. The payload is kept as
/// `serde_json::Value` at the bus boundary so `SqliteBus` never needs to
/// know the shape of any particular event; typed producers/consumers
/// serialize/deserialize the payload themselves (see `dto.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub attempt: u32,
    pub subject: String,
    pub tenant_id: String,
    pub schema_version: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a fresh envelope (`attempt = 1`, a new `messageId`).
    pub fn new(
        subject: impl Into<String>,
        correlation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        causation_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Envelope {
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            causation_id,
            occurred_at: Utc::now(),
            attempt: 1,
            subject: subject.into(),
            tenant_id: tenant_id.into(),
            schema_version: SCHEMA_VERSION.to_string(),
            payload,
        }
    }

    /// Derive the next delivery attempt of this same message (same
    /// `messageId`), used by the bus's internal redelivery path.
    pub fn redelivered(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Annotation attached to an envelope when it is routed to a DLQ (§4.1, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
    pub stack: Option<String>,
    pub last_attempt: DateTime<Utc>,
}

/// An envelope that landed on a `dlq.<subject>` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original: Envelope,
    pub failure: Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_starts_at_attempt_one() {
        let env = Envelope::new("job.jd.submitted", "job-1", "org-1", None, serde_json::json!({}));
        assert_eq!(env.attempt, 1);
        assert_eq!(env.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn redelivery_preserves_message_id_and_bumps_attempt() {
        let env = Envelope::new("job.jd.submitted", "job-1", "org-1", None, serde_json::json!({}));
        let redelivered = env.redelivered();
        assert_eq!(redelivered.message_id, env.message_id);
        assert_eq!(redelivered.attempt, 2);
    }
}

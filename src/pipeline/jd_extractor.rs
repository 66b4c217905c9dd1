//! C3: consumes `job.jd.submitted`, produces `JdDto`, publishes
//! `analysis.jd.extracted` (§4.3).

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::{PipelineError, ValidationError};
use crate::llm::retry::{retry_with_backoff, RetryConfig};
use crate::llm::LlmAdapter;
use crate::pipeline::bus::Bus;
use crate::pipeline::dto::JdDto;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::subjects::ANALYSIS_JD_EXTRACTED;
use crate::pipeline::worker::Handler;

pub struct JdExtractor {
    conn: Arc<Mutex<Connection>>,
    bus: Arc<dyn Bus>,
    llm: Arc<dyn LlmAdapter>,
}

impl JdExtractor {
    pub fn new(conn: Arc<Mutex<Connection>>, bus: Arc<dyn Bus>, llm: Arc<dyn LlmAdapter>) -> Self {
        JdExtractor { conn, bus, llm }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let job_id = envelope.correlation_id.clone();

        // Step 1: idempotency check keyed by the triggering message id (§4.3.1).
        if let Some(cached) = self.cached_jd(&envelope.message_id).await? {
            self.publish_extracted(&envelope, cached).await?;
            return Ok(());
        }

        let text = envelope
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("text".to_string()))?;

        // Step 2: extraction, retried in-process before ever reaching the
        // worker harness's nack/backoff. `From<LlmError>` classifies
        // vendor failures transient/permanent for the harness automatically.
        let extraction = retry_with_backoff(|| self.llm.extract_jd(text), RetryConfig::default()).await?;

        let jd = JdDto {
            job_id: job_id.clone(),
            required_skills: extraction.required_skills,
            experience_years: extraction.experience_years,
            education_level: extraction.education_level,
            soft_skills: extraction.soft_skills,
            job_title: extraction.job_title,
        };

        // Step 3: validation; an invariant violation is a permanent failure.
        jd.validate()?;

        self.cache_jd(&envelope.message_id, &job_id, &jd).await?;

        // Step 4: publish, then ack only after the bus accepts it (handled
        // by the worker harness once this returns Ok).
        self.publish_extracted(&envelope, jd).await?;
        Ok(())
    }

    async fn cached_jd(&self, message_id: &str) -> Result<Option<JdDto>, PipelineError> {
        let conn = self.conn.lock().await;
        let row: Option<String> = conn
            .query_row(
                "SELECT jd_dto FROM extraction_cache WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt extraction cache entry: {}", e)).into()),
        }
    }

    async fn cache_jd(&self, message_id: &str, job_id: &str, jd: &JdDto) -> Result<(), PipelineError> {
        let text = serde_json::to_string(jd)
            .map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO extraction_cache (message_id, job_id, jd_dto, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, job_id, text, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn publish_extracted(&self, trigger: &Envelope, jd: JdDto) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(&jd).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let out = Envelope::new(
            ANALYSIS_JD_EXTRACTED,
            trigger.correlation_id.clone(),
            trigger.tenant_id.clone(),
            Some(trigger.message_id.clone()),
            payload,
        );
        self.bus.publish(&out).await
    }
}

#[async_trait]
impl Handler for JdExtractor {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        JdExtractor::handle(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::llm::mock::MockLlmAdapter;
    use crate::pipeline::bus::SqliteBus;
    use crate::pipeline::subjects::{GROUP_SESSION_COORDINATOR, JOB_JD_SUBMITTED};

    fn setup() -> (JdExtractor, Arc<SqliteBus>) {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let extractor = JdExtractor::new(conn, bus.clone(), Arc::new(MockLlmAdapter::default()));
        (extractor, bus)
    }

    fn jd_envelope(text: &str) -> Envelope {
        Envelope::new(
            JOB_JD_SUBMITTED,
            "job-1",
            "org-1",
            None,
            serde_json::json!({"jobId": "job-1", "organizationId": "org-1", "text": text, "submittedAt": chrono::Utc::now()}),
        )
    }

    #[tokio::test]
    async fn extracts_and_publishes() {
        let (extractor, bus) = setup();
        let env = jd_envelope("Senior SRE needing go and kafka, 3 years experience, bachelor preferred.");
        extractor.handle(env.clone()).await.unwrap();

        let delivery = bus
            .poll(ANALYSIS_JD_EXTRACTED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.causation_id.as_deref(), Some(env.message_id.as_str()));
        let jd: JdDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(jd.job_id, "job-1");
    }

    #[tokio::test]
    async fn redelivered_message_reuses_cache_without_recalling_llm() {
        let (extractor, bus) = setup();
        let env = jd_envelope("Senior SRE needing go and kafka, 3 years experience.");
        extractor.handle(env.clone()).await.unwrap();
        // Drain the first publish so the second is distinguishable.
        bus.poll(ANALYSIS_JD_EXTRACTED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let redelivered = env.redelivered();
        extractor.handle(redelivered).await.unwrap();
        let delivery = bus
            .poll(ANALYSIS_JD_EXTRACTED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let jd: JdDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(jd.job_id, "job-1");
    }

    #[tokio::test]
    async fn extraction_with_no_recognizable_skills_is_a_permanent_failure() {
        let (extractor, _bus) = setup();
        let env = jd_envelope("We are hiring a wonderful person.");
        let result = extractor.handle(env).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().classify(), crate::errors::ErrorKind::Permanent);
    }
}

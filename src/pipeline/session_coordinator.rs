//! Owns the per-`jobId` session record and advances its state machine on
//! every observed event (C7, §4.7). Never mutates DTOs; only reads
//! envelopes and writes to its own `sessions`/`session_resumes` tables.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::PipelineError;
use crate::pipeline::envelope::{DeadLetter, Envelope};
use crate::pipeline::subjects::{
    ANALYSIS_JD_EXTRACTED, ANALYSIS_MATCH_SCORED, ANALYSIS_REPORT_GENERATED, ANALYSIS_RESUME_PARSED,
    JOB_JD_SUBMITTED, JOB_RESUME_SUBMITTED,
};
use crate::pipeline::worker::Handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Submitted,
    JdExtracted,
    ResumesParsed,
    Scored,
    Reported,
    Failed,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Submitted => "Submitted",
            Stage::JdExtracted => "JdExtracted",
            Stage::ResumesParsed => "ResumesParsed",
            Stage::Scored => "Scored",
            Stage::Reported => "Reported",
            Stage::Failed => "Failed",
        }
    }

    fn from_str(s: &str) -> Stage {
        match s {
            "JdExtracted" => Stage::JdExtracted,
            "ResumesParsed" => Stage::ResumesParsed,
            "Scored" => Stage::Scored,
            "Reported" => Stage::Reported,
            "Failed" => Stage::Failed,
            _ => Stage::Submitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeSubState {
    Submitted,
    Parsed,
    Scored,
    Reported,
    Failed,
}

impl ResumeSubState {
    fn as_str(self) -> &'static str {
        match self {
            ResumeSubState::Submitted => "Submitted",
            ResumeSubState::Parsed => "Parsed",
            ResumeSubState::Scored => "Scored",
            ResumeSubState::Reported => "Reported",
            ResumeSubState::Failed => "Failed",
        }
    }

    fn from_str(s: &str) -> ResumeSubState {
        match s {
            "Parsed" => ResumeSubState::Parsed,
            "Scored" => ResumeSubState::Scored,
            "Reported" => ResumeSubState::Reported,
            "Failed" => ResumeSubState::Failed,
            _ => ResumeSubState::Submitted,
        }
    }

    /// Ordinal used for gate checks; `Failed` outranks everything because
    /// a failed resume is resolved for the purpose of every later gate.
    fn rank(self) -> i32 {
        match self {
            ResumeSubState::Submitted => 0,
            ResumeSubState::Parsed => 1,
            ResumeSubState::Scored => 2,
            ResumeSubState::Reported => 3,
            ResumeSubState::Failed => 99,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub job_id: String,
    pub organization_id: String,
    pub stage: Stage,
    pub submitted_resumes: u32,
    pub parsed_resumes: u32,
    pub scored_resumes: u32,
    pub reported_resumes: u32,
    pub failed_resumes: u32,
    pub last_error: Option<String>,
}

pub struct SessionCoordinator {
    conn: Arc<Mutex<Connection>>,
}

impl SessionCoordinator {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        SessionCoordinator { conn }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let job_id = envelope.correlation_id.clone();

        if let Some(original_subject) = envelope.subject.strip_prefix("dlq.") {
            let dead_letter: DeadLetter = envelope.payload_as().map_err(|e| {
                crate::errors::ValidationError::InvalidFormat(format!("malformed DeadLetter payload: {}", e))
            })?;
            self.on_dead_letter(&job_id, original_subject, &dead_letter).await?;
            return Ok(());
        }

        match envelope.subject.as_str() {
            JOB_JD_SUBMITTED => self.on_jd_submitted(&job_id, &envelope).await?,
            JOB_RESUME_SUBMITTED => self.on_resume_submitted(&job_id, &envelope).await?,
            ANALYSIS_JD_EXTRACTED => self.on_jd_extracted(&job_id).await?,
            ANALYSIS_RESUME_PARSED => self.on_resume_event(&job_id, &envelope, ResumeSubState::Submitted, ResumeSubState::Parsed).await?,
            ANALYSIS_MATCH_SCORED => self.on_resume_event(&job_id, &envelope, ResumeSubState::Parsed, ResumeSubState::Scored).await?,
            ANALYSIS_REPORT_GENERATED => self.on_resume_event(&job_id, &envelope, ResumeSubState::Scored, ResumeSubState::Reported).await?,
            other => {
                return Err(crate::errors::ValidationError::InvalidFormat(format!(
                    "session coordinator cannot handle subject {:?}",
                    other
                ))
                .into())
            }
        }
        self.try_advance(&job_id).await?;
        Ok(())
    }

    async fn on_jd_submitted(&self, job_id: &str, envelope: &Envelope) -> Result<(), PipelineError> {
        let organization_id = envelope
            .payload
            .get("organizationId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (job_id, organization_id, created_at, stage)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, organization_id, chrono::Utc::now().to_rfc3339(), Stage::Submitted.as_str()],
        )?;
        Ok(())
    }

    async fn on_resume_submitted(&self, job_id: &str, envelope: &Envelope) -> Result<(), PipelineError> {
        let resume_id = envelope
            .payload
            .get("resumeId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::errors::ValidationError::MissingField("resumeId".to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO session_resumes (job_id, resume_id, sub_state) VALUES (?1, ?2, ?3)",
            params![job_id, resume_id, ResumeSubState::Submitted.as_str()],
        )?;
        Ok(())
    }

    async fn on_jd_extracted(&self, job_id: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET stage = ?1 WHERE job_id = ?2 AND stage = ?3",
            params![Stage::JdExtracted.as_str(), job_id, Stage::Submitted.as_str()],
        )?;
        Ok(())
    }

    async fn on_resume_event(
        &self,
        job_id: &str,
        envelope: &Envelope,
        from: ResumeSubState,
        to: ResumeSubState,
    ) -> Result<(), PipelineError> {
        let resume_id = envelope
            .payload
            .get("resumeId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::errors::ValidationError::MissingField("resumeId".to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE session_resumes SET sub_state = ?1 WHERE job_id = ?2 AND resume_id = ?3 AND sub_state = ?4",
            params![to.as_str(), job_id, resume_id, from.as_str()],
        )?;
        Ok(())
    }

    async fn on_dead_letter(&self, job_id: &str, original_subject: &str, dead_letter: &DeadLetter) -> Result<(), PipelineError> {
        if original_subject == JOB_JD_SUBMITTED {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE sessions SET stage = ?1, last_error = ?2, terminal_at = ?3
                 WHERE job_id = ?4 AND stage NOT IN (?5, ?6)",
                params![
                    Stage::Failed.as_str(),
                    dead_letter.failure.reason,
                    chrono::Utc::now().to_rfc3339(),
                    job_id,
                    Stage::Reported.as_str(),
                    Stage::Failed.as_str(),
                ],
            )?;
            return Ok(());
        }

        // A resume-scoped DLQ landing (job.resume.submitted, analysis.resume.parsed,
        // or analysis.match.scored) fails only that resume (§4.7).
        if let Some(resume_id) = dead_letter.original.payload.get("resumeId").and_then(|v| v.as_str()) {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE session_resumes SET sub_state = ?1 WHERE job_id = ?2 AND resume_id = ?3 AND sub_state != ?4",
                params![ResumeSubState::Failed.as_str(), job_id, resume_id, ResumeSubState::Reported.as_str()],
            )?;
        }
        Ok(())
    }

    /// Cascades the session through as many transitions as its current
    /// counts satisfy (§4.7). Handles out-of-order arrival: e.g. all
    /// resumes parsing before the JD is extracted (S5).
    async fn try_advance(&self, job_id: &str) -> Result<(), PipelineError> {
        loop {
            let conn = self.conn.lock().await;
            let stage: Option<String> = conn
                .query_row("SELECT stage FROM sessions WHERE job_id = ?1", params![job_id], |row| row.get(0))
                .optional()?;
            let Some(stage) = stage.map(|s| Stage::from_str(&s)) else { return Ok(()) };
            if stage == Stage::Reported || stage == Stage::Failed {
                return Ok(());
            }

            let submitted: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_resumes WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )?;

            let gate = |min_rank: i32, conn: &Connection| -> rusqlite::Result<bool> {
                if submitted == 0 {
                    return Ok(false);
                }
                let resolved: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM session_resumes WHERE job_id = ?1 AND
                        (CASE sub_state
                            WHEN 'Submitted' THEN 0 WHEN 'Parsed' THEN 1 WHEN 'Scored' THEN 2
                            WHEN 'Reported' THEN 3 WHEN 'Failed' THEN 99 ELSE 0 END) >= ?2",
                    params![job_id, min_rank],
                    |row| row.get(0),
                )?;
                Ok(resolved == submitted)
            };

            let next = match stage {
                Stage::Submitted => None, // requires analysis.jd.extracted, handled in on_jd_extracted
                Stage::JdExtracted => gate(ResumeSubState::Parsed.rank(), &conn)?.then_some(Stage::ResumesParsed),
                Stage::ResumesParsed => gate(ResumeSubState::Scored.rank(), &conn)?.then_some(Stage::Scored),
                Stage::Scored => gate(ResumeSubState::Reported.rank(), &conn)?.then_some(Stage::Reported),
                Stage::Reported | Stage::Failed => None,
            };

            let Some(next) = next else { return Ok(()) };
            let terminal_at = if next == Stage::Reported { Some(chrono::Utc::now().to_rfc3339()) } else { None };
            conn.execute(
                "UPDATE sessions SET stage = ?1, terminal_at = ?2 WHERE job_id = ?3",
                params![next.as_str(), terminal_at, job_id],
            )?;
        }
    }

    pub async fn snapshot(&self, job_id: &str) -> Result<Option<SessionSnapshot>, PipelineError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT organization_id, stage, last_error FROM sessions WHERE job_id = ?1",
                params![job_id],
                |row| {
                    let organization_id: String = row.get(0)?;
                    let stage: String = row.get(1)?;
                    let last_error: Option<String> = row.get(2)?;
                    Ok((organization_id, stage, last_error))
                },
            )
            .optional()?;
        let Some((organization_id, stage, last_error)) = row else { return Ok(None) };

        let mut stmt = conn.prepare("SELECT sub_state FROM session_resumes WHERE job_id = ?1")?;
        let sub_states: Vec<String> = stmt
            .query_map(params![job_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let submitted_resumes = sub_states.len() as u32;
        let count_at_least = |min_rank: i32| {
            sub_states
                .iter()
                .filter(|s| ResumeSubState::from_str(s).rank() >= min_rank)
                .count() as u32
        };

        Ok(Some(SessionSnapshot {
            job_id: job_id.to_string(),
            organization_id,
            stage: Stage::from_str(&stage),
            submitted_resumes,
            parsed_resumes: count_at_least(ResumeSubState::Parsed.rank()),
            scored_resumes: count_at_least(ResumeSubState::Scored.rank()),
            reported_resumes: count_at_least(ResumeSubState::Reported.rank()),
            failed_resumes: sub_states.iter().filter(|s| s.as_str() == "Failed").count() as u32,
            last_error,
        }))
    }
}

#[async_trait]
impl Handler for SessionCoordinator {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        SessionCoordinator::handle(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn coordinator() -> SessionCoordinator {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        SessionCoordinator::new(Arc::new(Mutex::new(conn)))
    }

    fn envelope(subject: &str, job_id: &str, payload: serde_json::Value) -> Envelope {
        Envelope::new(subject, job_id, "org-1", None, payload)
    }

    #[tokio::test]
    async fn full_single_resume_happy_path_reaches_reported() {
        let coord = coordinator();
        coord
            .handle(envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({"organizationId": "org-1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        coord.handle(envelope(ANALYSIS_JD_EXTRACTED, "job-1", serde_json::json!({}))).await.unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::JdExtracted);

        coord
            .handle(envelope(ANALYSIS_RESUME_PARSED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::ResumesParsed);

        coord
            .handle(envelope(ANALYSIS_MATCH_SCORED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(ANALYSIS_REPORT_GENERATED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::Reported);
    }

    #[tokio::test]
    async fn resume_parsed_before_jd_extracted_still_cascades_correctly() {
        let coord = coordinator();
        coord
            .handle(envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({"organizationId": "org-1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(ANALYSIS_RESUME_PARSED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::Submitted, "cannot advance past Submitted without JdExtracted");

        coord.handle(envelope(ANALYSIS_JD_EXTRACTED, "job-1", serde_json::json!({}))).await.unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::ResumesParsed, "should cascade straight through JdExtracted");
    }

    #[tokio::test]
    async fn duplicate_events_do_not_double_count() {
        let coord = coordinator();
        coord
            .handle(envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({"organizationId": "org-1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        for _ in 0..3 {
            coord
                .handle(envelope(ANALYSIS_RESUME_PARSED, "job-1", serde_json::json!({"resumeId": "r1"})))
                .await
                .unwrap();
        }
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.parsed_resumes, 1);
    }

    #[tokio::test]
    async fn jd_dlq_fails_whole_session() {
        let coord = coordinator();
        coord
            .handle(envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({"organizationId": "org-1"})))
            .await
            .unwrap();
        let dead_letter = DeadLetter {
            original: envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({})),
            failure: crate::pipeline::envelope::Failure {
                reason: "invalid JD text".to_string(),
                stack: None,
                last_attempt: chrono::Utc::now(),
            },
        };
        coord
            .handle(envelope(
                &crate::pipeline::subjects::dlq_subject(JOB_JD_SUBMITTED),
                "job-1",
                serde_json::to_value(&dead_letter).unwrap(),
            ))
            .await
            .unwrap();
        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::Failed);
    }

    #[tokio::test]
    async fn resume_dlq_fails_only_that_resume_not_the_session() {
        let coord = coordinator();
        coord
            .handle(envelope(JOB_JD_SUBMITTED, "job-1", serde_json::json!({"organizationId": "org-1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r1"})))
            .await
            .unwrap();
        coord
            .handle(envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r2"})))
            .await
            .unwrap();
        coord.handle(envelope(ANALYSIS_JD_EXTRACTED, "job-1", serde_json::json!({}))).await.unwrap();

        let dead_letter = DeadLetter {
            original: envelope(JOB_RESUME_SUBMITTED, "job-1", serde_json::json!({"resumeId": "r1"})),
            failure: crate::pipeline::envelope::Failure {
                reason: "checksum mismatch".to_string(),
                stack: None,
                last_attempt: chrono::Utc::now(),
            },
        };
        coord
            .handle(envelope(
                &crate::pipeline::subjects::dlq_subject(JOB_RESUME_SUBMITTED),
                "job-1",
                serde_json::to_value(&dead_letter).unwrap(),
            ))
            .await
            .unwrap();

        coord
            .handle(envelope(ANALYSIS_RESUME_PARSED, "job-1", serde_json::json!({"resumeId": "r2"})))
            .await
            .unwrap();

        let snapshot = coord.snapshot("job-1").await.unwrap().unwrap();
        assert_eq!(snapshot.stage, Stage::ResumesParsed, "r1 failed but r2 parsed, session should still advance");
        assert_eq!(snapshot.failed_resumes, 1);
    }
}

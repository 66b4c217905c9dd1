//! C5: consumes `analysis.jd.extracted` and `analysis.resume.parsed` under
//! group `scoring-engines`, maintains the pairing cache, and publishes
//! `analysis.match.scored` (§4.5).

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::errors::{BusError, PipelineError, ValidationError};
use crate::pipeline::bus::Bus;
use crate::pipeline::dto::{EducationLevel, JdDto, Recommendation, ResumeDto, ScoreBreakdown, ScoreDto, SCORE_WEIGHTS};
use crate::pipeline::envelope::{DeadLetter, Envelope, Failure};
use crate::pipeline::subjects::{dlq_subject, ANALYSIS_JD_EXTRACTED, ANALYSIS_MATCH_SCORED, ANALYSIS_RESUME_PARSED};
use crate::pipeline::worker::Handler;

fn round_half_up_2dp(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

/// The five-step algorithm from §4.5. Pure and deterministic: identical
/// `(Jd, Resume)` always produces identical `ScoreDto` (§4.5 "Ties").
pub fn score_resume(jd: &JdDto, resume: &ResumeDto) -> ScoreDto {
    let mut missing_mandatory_skills = BTreeSet::new();
    let mut matched_skills = BTreeSet::new();
    let mut any_mandatory_missing = false;
    for req in &jd.required_skills {
        if resume.skills.contains(&req.name) {
            matched_skills.insert(req.name.clone());
        } else if req.mandatory {
            missing_mandatory_skills.insert(req.name.clone());
            any_mandatory_missing = true;
        }
    }

    let weight_sum: f64 = jd.required_skills.iter().map(|s| s.weight).sum();
    let skills_score = if any_mandatory_missing {
        0.0
    } else if weight_sum <= 0.0 {
        100.0
    } else {
        let matched_weight: f64 = jd
            .required_skills
            .iter()
            .filter(|s| resume.skills.contains(&s.name))
            .map(|s| s.weight)
            .sum();
        100.0 * matched_weight / weight_sum
    };

    let y = resume.total_years_experience;
    let a = jd.experience_years.min as f64;
    let experience_score = match jd.experience_years.max {
        Some(max) if y > max as f64 => (100.0 - 5.0 * (y - max as f64)).max(60.0),
        Some(max) if y >= a && y <= max as f64 => 100.0,
        None if y >= a => 100.0,
        _ if y < a => {
            if a <= 0.0 {
                100.0
            } else {
                (100.0 * y / a).max(0.0)
            }
        }
        _ => 100.0,
    };

    let r = jd.education_level.level();
    let c = resume.education.iter().map(|d| d.level.level()).max().unwrap_or(0);
    let education_score = if r == 0 {
        100.0
    } else if c >= r {
        100.0
    } else {
        (100.0 - 25.0 * (r as f64 - c as f64)).max(0.0)
    };

    let soft_skill_matches = jd.soft_skills.intersection(&resume.inferred_soft_skills).count();
    let soft_skills_score = 100.0 * soft_skill_matches as f64 / jd.soft_skills.len().max(1) as f64;

    let overall_raw = skills_score * SCORE_WEIGHTS.skills
        + experience_score * SCORE_WEIGHTS.experience
        + education_score * SCORE_WEIGHTS.education
        + soft_skills_score * SCORE_WEIGHTS.soft_skills;
    let overall = round_half_up_2dp(overall_raw.clamp(0.0, 100.0));

    let recommendation = if any_mandatory_missing {
        Recommendation::NoMatch
    } else if overall >= 80.0 {
        Recommendation::StrongMatch
    } else if overall >= 65.0 {
        Recommendation::Match
    } else if overall >= 45.0 {
        Recommendation::WeakMatch
    } else {
        Recommendation::NoMatch
    };

    ScoreDto {
        job_id: jd.job_id.clone(),
        resume_id: resume.resume_id.clone(),
        overall,
        breakdown: ScoreBreakdown {
            skills: round_half_up_2dp(skills_score),
            experience: round_half_up_2dp(experience_score),
            education: round_half_up_2dp(education_score),
            soft_skills: round_half_up_2dp(soft_skills_score),
        },
        weights_used: SCORE_WEIGHTS,
        matched_skills,
        missing_mandatory_skills,
        recommendation,
        actual_experience_years: y,
    }
}

pub struct ScoringEngine {
    conn: Arc<Mutex<Connection>>,
    bus: Arc<dyn Bus>,
    pairing_ttl: Duration,
}

impl ScoringEngine {
    pub fn new(conn: Arc<Mutex<Connection>>, bus: Arc<dyn Bus>, pairing_ttl: Duration) -> Self {
        ScoringEngine { conn, bus, pairing_ttl }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        match envelope.subject.as_str() {
            ANALYSIS_JD_EXTRACTED => self.on_jd_extracted(envelope).await,
            ANALYSIS_RESUME_PARSED => self.on_resume_parsed(envelope).await,
            other => Err(ValidationError::InvalidFormat(format!(
                "scoring engine cannot handle subject {:?}",
                other
            ))
            .into()),
        }
    }

    /// Drain any resumes that arrived before this JD (S5). Scoped to this
    /// `jobId`'s row in `pairing_cache` — never a global lock (§5, §9).
    async fn on_jd_extracted(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let jd: JdDto = envelope
            .payload_as()
            .map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let job_id = jd.job_id.clone();

        let pending = {
            let conn = self.conn.lock().await;
            let jd_text = serde_json::to_string(&jd).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
            conn.execute(
                "INSERT INTO pairing_cache (job_id, jd_dto) VALUES (?1, ?2)
                 ON CONFLICT(job_id) DO UPDATE SET jd_dto = excluded.jd_dto",
                params![job_id, jd_text],
            )?;

            let mut stmt = conn.prepare(
                "SELECT resume_dto FROM pairing_cache_pending_resumes WHERE job_id = ?1",
            )?;
            let rows: Vec<String> = stmt.query_map(params![job_id], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
            conn.execute("DELETE FROM pairing_cache_pending_resumes WHERE job_id = ?1", params![job_id])?;
            rows
        };

        for resume_text in pending {
            let resume: ResumeDto = serde_json::from_str(&resume_text)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt pending resume: {}", e)))?;
            let score = score_resume(&jd, &resume);
            self.publish_score(&envelope, score).await?;
        }
        Ok(())
    }

    async fn on_resume_parsed(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let resume: ResumeDto = envelope
            .payload_as()
            .map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let job_id = resume.job_id.clone();

        let cached_jd: Option<String> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT jd_dto FROM pairing_cache WHERE job_id = ?1 AND jd_dto IS NOT NULL",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match cached_jd {
            Some(jd_text) => {
                let jd: JdDto = serde_json::from_str(&jd_text)
                    .map_err(|e| ValidationError::InvalidFormat(format!("corrupt pairing cache entry: {}", e)))?;
                let score = score_resume(&jd, &resume);
                self.publish_score(&envelope, score).await?;
            }
            None => {
                let resume_text =
                    serde_json::to_string(&resume).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
                let conn = self.conn.lock().await;
                conn.execute(
                    "INSERT INTO pairing_cache (job_id, jd_dto) VALUES (?1, NULL) ON CONFLICT(job_id) DO NOTHING",
                    params![job_id],
                )?;
                conn.execute(
                    "INSERT OR REPLACE INTO pairing_cache_pending_resumes (job_id, resume_id, resume_dto, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![job_id, resume.resume_id, resume_text, envelope.occurred_at.to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }

    async fn publish_score(&self, trigger: &Envelope, score: ScoreDto) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(&score).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let out = Envelope::new(
            ANALYSIS_MATCH_SCORED,
            trigger.correlation_id.clone(),
            trigger.tenant_id.clone(),
            Some(trigger.message_id.clone()),
            payload,
        );
        self.bus.publish(&out).await
    }

    /// Periodic sweep: pending resumes waiting longer than `pairingTtl`
    /// without a JD are routed to `dlq.analysis.resume.parsed` (§4.5).
    /// Not delivery-scoped (there is no in-flight bus delivery for an
    /// expired cache entry), so it publishes the DLQ envelope directly
    /// rather than going through `Bus::dead_letter`.
    pub async fn sweep_stale_pending(&self) -> Result<usize, PipelineError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.pairing_ttl).unwrap_or(chrono::Duration::hours(24));
        let stale: Vec<(String, String, String)> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT job_id, resume_id, resume_dto FROM pairing_cache_pending_resumes WHERE enqueued_at < ?1",
            )?;
            stmt.query_map(params![cutoff.to_rfc3339()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        };

        for (job_id, resume_id, resume_text) in &stale {
            let resume: ResumeDto = serde_json::from_str(resume_text)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt pending resume: {}", e)))?;
            let payload = serde_json::to_value(&resume).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
            let original = Envelope::new(ANALYSIS_RESUME_PARSED, job_id.clone(), "unknown", None, payload);
            let dead_letter = DeadLetter {
                original: original.clone(),
                failure: Failure {
                    reason: format!("no JD arrived within pairingTtl for jobId {}", job_id),
                    stack: None,
                    last_attempt: Utc::now(),
                },
            };
            let dlq_payload =
                serde_json::to_value(&dead_letter).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
            let dlq_envelope = Envelope::new(
                dlq_subject(ANALYSIS_RESUME_PARSED),
                job_id.clone(),
                "unknown",
                Some(original.message_id.clone()),
                dlq_payload,
            );
            self.bus.publish(&dlq_envelope).await.map_err(|e| {
                BusError::PublishRejected(format!("failed to DLQ stale resume {}: {}", resume_id, e))
            })?;
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pairing_cache_pending_resumes WHERE enqueued_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(stale.len())
    }
}

#[async_trait]
impl Handler for ScoringEngine {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        ScoringEngine::handle(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::pipeline::bus::SqliteBus;
    use crate::pipeline::dto::{ContactInfo, Degree, Experience, ExperienceYears, RawFileRef, SkillRequirement};
    use crate::pipeline::subjects::{GROUP_SESSION_COORDINATOR, JOB_RESUME_SUBMITTED};

    fn sample_jd() -> JdDto {
        JdDto {
            job_id: "job-1".to_string(),
            required_skills: vec![
                SkillRequirement { name: "go".to_string(), weight: 0.6, mandatory: true },
                SkillRequirement { name: "kafka".to_string(), weight: 0.4, mandatory: false },
            ],
            experience_years: ExperienceYears { min: 3, max: Some(8) },
            education_level: EducationLevel::Bachelor,
            soft_skills: BTreeSet::from(["leadership".to_string()]),
            job_title: "SRE".to_string(),
        }
    }

    fn sample_resume(skills: &[&str], years: f64, level: EducationLevel, soft: &[&str]) -> ResumeDto {
        ResumeDto {
            resume_id: "r1".to_string(),
            job_id: "job-1".to_string(),
            contact_info: ContactInfo { name: "Jane".to_string(), email: None, phone: None },
            skills: skills.iter().map(|s| s.to_string()).collect(),
            work_experience: vec![],
            education: vec![Degree { institution: "U".to_string(), field: "CS".to_string(), level }],
            total_years_experience: years,
            raw_file_ref: RawFileRef { file_id: "f1".to_string(), checksum: "x".to_string() },
            inferred_soft_skills: soft.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn s1_strong_match() {
        let jd = sample_jd();
        let resume = sample_resume(&["go", "kafka", "linux"], 5.0, EducationLevel::Master, &["leadership", "mentoring"]);
        let score = score_resume(&jd, &resume);
        assert_eq!(score.breakdown.skills, 100.0);
        assert_eq!(score.breakdown.experience, 100.0);
        assert_eq!(score.breakdown.education, 100.0);
        assert_eq!(score.breakdown.soft_skills, 100.0);
        assert_eq!(score.overall, 100.0);
        assert_eq!(score.recommendation, Recommendation::StrongMatch);
    }

    #[test]
    fn s2_missing_mandatory_skill_forces_no_match() {
        let jd = sample_jd();
        let resume = sample_resume(&["kafka", "linux"], 5.0, EducationLevel::Master, &["leadership", "mentoring"]);
        let score = score_resume(&jd, &resume);
        assert_eq!(score.breakdown.skills, 0.0);
        assert_eq!(score.overall, 50.0);
        assert_eq!(score.missing_mandatory_skills, BTreeSet::from(["go".to_string()]));
        assert_eq!(score.recommendation, Recommendation::NoMatch);
    }

    #[test]
    fn s3_overqualification_penalty_floors_at_sixty() {
        let jd = sample_jd();
        let resume = sample_resume(&["go", "kafka", "linux"], 15.0, EducationLevel::Master, &["leadership"]);
        let score = score_resume(&jd, &resume);
        assert_eq!(score.breakdown.experience, 65.0);
    }

    #[test]
    fn s4_under_experience_scales_linearly() {
        let jd = sample_jd();
        let resume = sample_resume(&["go", "kafka"], 1.0, EducationLevel::Master, &["leadership"]);
        let score = score_resume(&jd, &resume);
        assert!((score.breakdown.experience - 33.33).abs() < 0.01);
    }

    #[tokio::test]
    async fn s5_resume_before_jd_emits_exactly_one_score_with_empty_pending_queue() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let engine = ScoringEngine::new(conn.clone(), bus.clone(), Duration::from_secs(24 * 3600));

        let resume = sample_resume(&["go", "kafka", "linux"], 5.0, EducationLevel::Master, &["leadership"]);
        let resume_envelope = Envelope::new(
            ANALYSIS_RESUME_PARSED,
            "job-1",
            "org-1",
            None,
            serde_json::to_value(&resume).unwrap(),
        );
        engine.handle(resume_envelope).await.unwrap();

        let pending: i64 = {
            let conn = conn.lock().await;
            conn.query_row("SELECT COUNT(*) FROM pairing_cache_pending_resumes", [], |row| row.get(0)).unwrap()
        };
        assert_eq!(pending, 1);

        let jd = sample_jd();
        let jd_envelope = Envelope::new(ANALYSIS_JD_EXTRACTED, "job-1", "org-1", None, serde_json::to_value(&jd).unwrap());
        engine.handle(jd_envelope).await.unwrap();

        let pending_after: i64 = {
            let conn = conn.lock().await;
            conn.query_row("SELECT COUNT(*) FROM pairing_cache_pending_resumes", [], |row| row.get(0)).unwrap()
        };
        assert_eq!(pending_after, 0, "pending queue must be drained");

        let first = bus
            .poll(ANALYSIS_MATCH_SCORED, GROUP_SESSION_COORDINATOR, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = bus
            .poll(ANALYSIS_MATCH_SCORED, GROUP_SESSION_COORDINATOR, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none(), "exactly one analysis.match.scored must be emitted");
    }

    #[tokio::test]
    async fn jd_arriving_first_scores_resume_immediately() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let engine = ScoringEngine::new(conn, bus.clone(), Duration::from_secs(24 * 3600));

        let jd = sample_jd();
        engine
            .handle(Envelope::new(ANALYSIS_JD_EXTRACTED, "job-1", "org-1", None, serde_json::to_value(&jd).unwrap()))
            .await
            .unwrap();

        let resume = sample_resume(&["go", "kafka"], 5.0, EducationLevel::Master, &["leadership"]);
        engine
            .handle(Envelope::new(ANALYSIS_RESUME_PARSED, "job-1", "org-1", None, serde_json::to_value(&resume).unwrap()))
            .await
            .unwrap();

        let delivery = bus
            .poll(ANALYSIS_MATCH_SCORED, GROUP_SESSION_COORDINATOR, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let score: ScoreDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(score.resume_id, "r1");
    }

    #[tokio::test]
    async fn stale_pending_resume_is_swept_to_dlq() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let engine = ScoringEngine::new(conn.clone(), bus.clone(), Duration::from_secs(1));

        let resume = sample_resume(&["go"], 5.0, EducationLevel::Master, &[]);
        {
            let conn = conn.lock().await;
            conn.execute(
                "INSERT INTO pairing_cache (job_id, jd_dto) VALUES ('job-1', NULL)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO pairing_cache_pending_resumes (job_id, resume_id, resume_dto, enqueued_at)
                 VALUES ('job-1', 'r1', ?1, ?2)",
                params![
                    serde_json::to_string(&resume).unwrap(),
                    (Utc::now() - chrono::Duration::hours(25)).to_rfc3339()
                ],
            )
            .unwrap();
        }

        let swept = engine.sweep_stale_pending().await.unwrap();
        assert_eq!(swept, 1);

        let dlq = dlq_subject(ANALYSIS_RESUME_PARSED);
        let on_dlq = bus.poll(&dlq, GROUP_SESSION_COORDINATOR, Duration::from_secs(30)).await.unwrap();
        assert!(on_dlq.is_some());
    }
}

//! C6: consumes `analysis.match.scored`, renders `ReportDto`, publishes
//! `analysis.report.generated` (§4.6). Idempotent on `(jobId, resumeId)`.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::{PipelineError, ValidationError};
use crate::llm::LlmAdapter;
use crate::pipeline::bus::Bus;
use crate::pipeline::dto::{Decision, JdDto, Recommendation, ReportDto, ScoreDto};
use crate::pipeline::envelope::Envelope;
use crate::pipeline::subjects::ANALYSIS_REPORT_GENERATED;
use crate::pipeline::worker::Handler;

fn summarize(score: &ScoreDto) -> String {
    let band = match score.recommendation {
        Recommendation::StrongMatch => "a strong match",
        Recommendation::Match => "a solid match",
        Recommendation::WeakMatch => "a weak match",
        Recommendation::NoMatch => "not a match",
    };
    format!(
        "Candidate {} is {} for this role with an overall score of {:.2} \
         (skills {:.2}, experience {:.2}, education {:.2}, soft skills {:.2}).",
        score.resume_id,
        band,
        score.overall,
        score.breakdown.skills,
        score.breakdown.experience,
        score.breakdown.education,
        score.breakdown.soft_skills,
    )
}

/// Strengths: `matchedSkills` ranked by the JD's own weight desc, capped at 5.
fn strengths(jd: &JdDto, score: &ScoreDto) -> Vec<String> {
    let mut ranked: Vec<(&str, f64)> = jd
        .required_skills
        .iter()
        .filter(|s| score.matched_skills.contains(&s.name))
        .map(|s| (s.name.as_str(), s.weight))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().take(5).map(|(name, _)| name.to_string()).collect()
}

/// Concerns: every missing mandatory skill, then non-mandatory gaps ranked
/// by weight desc, capped total at 5 (§4.6).
fn concerns(jd: &JdDto, score: &ScoreDto) -> Vec<String> {
    let mut out: Vec<String> = score.missing_mandatory_skills.iter().cloned().collect();

    let mut optional_gaps: Vec<(&str, f64)> = jd
        .required_skills
        .iter()
        .filter(|s| !s.mandatory && !score.matched_skills.contains(&s.name))
        .map(|s| (s.name.as_str(), s.weight))
        .collect();
    optional_gaps.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (name, _) in optional_gaps {
        if out.len() >= 5 {
            break;
        }
        out.push(name.to_string());
    }
    out.truncate(5);
    out
}

/// Fixed suggestion rules (§4.6).
fn suggestions(jd: &JdDto, score: &ScoreDto) -> Vec<String> {
    let mut out = Vec::new();
    // Compare actual years against the floor directly: `breakdown.experience`
    // also dips below 100 for over-qualified candidates (§4.5's over-max
    // penalty), which isn't an experience gap.
    if score.actual_experience_years < jd.experience_years.min as f64 {
        out.push(format!(
            "Bridge {} years of experience via supervised or stretch assignments before full ramp-up.",
            jd.experience_years.min
        ));
    }
    let r = jd.education_level.level();
    let c_from_education = if score.breakdown.education >= 100.0 { r } else { 0 };
    let gap = r as i32 - c_from_education as i32;
    if gap >= 2 {
        out.push("Consider certification paths to close the education gap.".to_string());
    }
    out
}

fn decision(recommendation: Recommendation) -> Decision {
    match recommendation {
        Recommendation::StrongMatch | Recommendation::Match => Decision::Interview,
        Recommendation::WeakMatch => Decision::Hold,
        Recommendation::NoMatch => Decision::Reject,
    }
}

pub struct ReportGenerator {
    conn: Arc<Mutex<Connection>>,
    bus: Arc<dyn Bus>,
    llm: Arc<dyn LlmAdapter>,
}

impl ReportGenerator {
    pub fn new(conn: Arc<Mutex<Connection>>, bus: Arc<dyn Bus>, llm: Arc<dyn LlmAdapter>) -> Self {
        ReportGenerator { conn, bus, llm }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let score: ScoreDto = envelope
            .payload_as()
            .map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;

        if let Some(cached) = self.cached_report(&score.job_id, &score.resume_id).await? {
            self.publish_report(&envelope, cached).await?;
            return Ok(());
        }

        // C6 needs the JD to rank strengths/concerns/suggestions by weight;
        // the scoring engine's pairing cache already holds it keyed by jobId.
        let jd: JdDto = {
            let conn = self.conn.lock().await;
            let jd_text: Option<String> = conn
                .query_row(
                    "SELECT jd_dto FROM pairing_cache WHERE job_id = ?1 AND jd_dto IS NOT NULL",
                    params![score.job_id],
                    |row| row.get(0),
                )
                .optional()?;
            let jd_text = jd_text.ok_or_else(|| {
                ValidationError::InvariantViolation(format!(
                    "no cached JD for jobId {} when generating report",
                    score.job_id
                ))
            })?;
            serde_json::from_str(&jd_text)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt pairing cache entry: {}", e)))?
        };

        let report = ReportDto {
            job_id: score.job_id.clone(),
            resume_id: score.resume_id.clone(),
            summary: summarize(&score),
            strengths: strengths(&jd, &score),
            concerns: concerns(&jd, &score),
            suggestions: suggestions(&jd, &score),
            decision: decision(score.recommendation),
            generated_at: chrono::Utc::now(),
            model_version: self.llm.model_version().to_string(),
        };

        self.cache_report(&report).await?;
        self.publish_report(&envelope, report).await?;
        Ok(())
    }

    async fn cached_report(&self, job_id: &str, resume_id: &str) -> Result<Option<ReportDto>, PipelineError> {
        let conn = self.conn.lock().await;
        let row: Option<String> = conn
            .query_row(
                "SELECT report_dto FROM reports WHERE job_id = ?1 AND resume_id = ?2",
                params![job_id, resume_id],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt report cache entry: {}", e)).into()),
        }
    }

    async fn cache_report(&self, report: &ReportDto) -> Result<(), PipelineError> {
        let text = serde_json::to_string(report).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO reports (job_id, resume_id, report_dto, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![report.job_id, report.resume_id, text, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn publish_report(&self, trigger: &Envelope, report: ReportDto) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(&report).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let out = Envelope::new(
            ANALYSIS_REPORT_GENERATED,
            trigger.correlation_id.clone(),
            trigger.tenant_id.clone(),
            Some(trigger.message_id.clone()),
            payload,
        );
        self.bus.publish(&out).await
    }
}

#[async_trait]
impl Handler for ReportGenerator {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        ReportGenerator::handle(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::llm::mock::MockLlmAdapter;
    use crate::pipeline::bus::SqliteBus;
    use crate::pipeline::dto::{EducationLevel, ExperienceYears, ScoreBreakdown, ScoreWeights, SkillRequirement};
    use crate::pipeline::subjects::{ANALYSIS_MATCH_SCORED, GROUP_SESSION_COORDINATOR};
    use std::collections::BTreeSet;

    fn sample_jd() -> JdDto {
        JdDto {
            job_id: "job-1".to_string(),
            required_skills: vec![
                SkillRequirement { name: "go".to_string(), weight: 0.6, mandatory: true },
                SkillRequirement { name: "kafka".to_string(), weight: 0.4, mandatory: false },
            ],
            experience_years: ExperienceYears { min: 3, max: Some(8) },
            education_level: EducationLevel::Bachelor,
            soft_skills: BTreeSet::new(),
            job_title: "SRE".to_string(),
        }
    }

    fn sample_score(recommendation: Recommendation, missing: &[&str]) -> ScoreDto {
        sample_score_with_experience(recommendation, missing, 100.0, 5.0)
    }

    fn sample_score_with_experience(
        recommendation: Recommendation,
        missing: &[&str],
        experience_breakdown: f64,
        actual_experience_years: f64,
    ) -> ScoreDto {
        ScoreDto {
            job_id: "job-1".to_string(),
            resume_id: "r1".to_string(),
            overall: 50.0,
            breakdown: ScoreBreakdown { skills: 0.0, experience: experience_breakdown, education: 100.0, soft_skills: 100.0 },
            weights_used: ScoreWeights { skills: 0.5, experience: 0.25, education: 0.15, soft_skills: 0.10 },
            matched_skills: BTreeSet::new(),
            missing_mandatory_skills: missing.iter().map(|s| s.to_string()).collect(),
            recommendation,
            actual_experience_years,
        }
    }

    async fn setup() -> (ReportGenerator, Arc<SqliteBus>, Arc<Mutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        {
            let jd = sample_jd();
            let guard = conn.lock().await;
            guard
                .execute(
                    "INSERT INTO pairing_cache (job_id, jd_dto) VALUES ('job-1', ?1)",
                    params![serde_json::to_string(&jd).unwrap()],
                )
                .unwrap();
        }
        let generator = ReportGenerator::new(conn.clone(), bus.clone(), Arc::new(MockLlmAdapter::default()));
        (generator, bus, conn)
    }

    #[tokio::test]
    async fn no_match_recommendation_maps_to_reject_decision() {
        let (generator, bus, _conn) = setup().await;
        let score = sample_score(Recommendation::NoMatch, &["go"]);
        let env = Envelope::new(ANALYSIS_MATCH_SCORED, "job-1", "org-1", None, serde_json::to_value(&score).unwrap());
        generator.handle(env).await.unwrap();

        let delivery = bus
            .poll(ANALYSIS_REPORT_GENERATED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let report: ReportDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(report.decision, Decision::Reject);
        assert_eq!(report.concerns, vec!["go".to_string()]);
    }

    #[test]
    fn overqualified_candidate_gets_no_experience_bridge_suggestion() {
        let jd = sample_jd();
        // 15 years against a {min: 3, max: 8} range: over-max penalty drags
        // the sub-score to 65, but the candidate has plenty of experience.
        let score = sample_score_with_experience(Recommendation::Match, &[], 65.0, 15.0);
        let out = suggestions(&jd, &score);
        assert!(
            out.iter().all(|s| !s.starts_with("Bridge")),
            "over-qualified candidates must not be told to bridge an experience gap: {:?}",
            out
        );
    }

    #[test]
    fn underexperienced_candidate_gets_experience_bridge_suggestion() {
        let jd = sample_jd();
        let score = sample_score_with_experience(Recommendation::WeakMatch, &[], 33.33, 1.0);
        let out = suggestions(&jd, &score);
        assert!(out.iter().any(|s| s.starts_with("Bridge 3 years")));
    }

    #[tokio::test]
    async fn redelivery_is_idempotent_and_reuses_cached_report() {
        let (generator, bus, _conn) = setup().await;
        let score = sample_score(Recommendation::NoMatch, &["go"]);
        let env = Envelope::new(ANALYSIS_MATCH_SCORED, "job-1", "org-1", None, serde_json::to_value(&score).unwrap());
        generator.handle(env.clone()).await.unwrap();
        bus.poll(ANALYSIS_REPORT_GENERATED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap();

        generator.handle(env.redelivered()).await.unwrap();
        let delivery = bus
            .poll(ANALYSIS_REPORT_GENERATED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let report: ReportDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(report.resume_id, "r1");
    }
}

//! Data transfer objects owned by each producer (§3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EducationLevel {
    HighSchool,
    Associate,
    Bachelor,
    Master,
    Doctorate,
    Any,
}

impl EducationLevel {
    /// `{highSchool=1, associate=2, bachelor=3, master=4, doctorate=5, any=0}` (§4.5.3).
    pub fn level(self) -> u8 {
        match self {
            EducationLevel::HighSchool => 1,
            EducationLevel::Associate => 2,
            EducationLevel::Bachelor => 3,
            EducationLevel::Master => 4,
            EducationLevel::Doctorate => 5,
            EducationLevel::Any => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRequirement {
    pub name: String,
    pub weight: f64,
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceYears {
    pub min: u32,
    /// `None` represents the unbounded upper end (`∞`).
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JdDto {
    pub job_id: String,
    pub required_skills: Vec<SkillRequirement>,
    pub experience_years: ExperienceYears,
    pub education_level: EducationLevel,
    pub soft_skills: BTreeSet<String>,
    pub job_title: String,
}

impl JdDto {
    /// §3 invariant: Σ weight of mandatory skills ≤ 1.0; `min ≤ max`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_id.trim().is_empty() {
            return Err(ValidationError::MissingField("jobId".to_string()));
        }
        let mandatory_weight: f64 = self
            .required_skills
            .iter()
            .filter(|s| s.mandatory)
            .map(|s| s.weight)
            .sum();
        if mandatory_weight > 1.0 + 1e-9 {
            return Err(ValidationError::InvariantViolation(format!(
                "mandatory skill weights sum to {:.4}, exceeds 1.0",
                mandatory_weight
            )));
        }
        if let Some(max) = self.experience_years.max {
            if self.experience_years.min > max {
                return Err(ValidationError::InvariantViolation(format!(
                    "experienceYears.min ({}) > experienceYears.max ({})",
                    self.experience_years.min, max
                )));
            }
        }
        for skill in &self.required_skills {
            if !(0.0..=1.0).contains(&skill.weight) {
                return Err(ValidationError::InvariantViolation(format!(
                    "skill {:?} has weight {} outside [0,1]",
                    skill.name, skill.weight
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experience {
    pub company: String,
    pub title: String,
    pub start_date: chrono::NaiveDate,
    /// `None` represents "present".
    pub end_date: Option<chrono::NaiveDate>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Degree {
    pub institution: String,
    pub field: String,
    pub level: EducationLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFileRef {
    pub file_id: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeDto {
    pub resume_id: String,
    pub job_id: String,
    pub contact_info: ContactInfo,
    pub skills: BTreeSet<String>,
    pub work_experience: Vec<Experience>,
    pub education: Vec<Degree>,
    pub total_years_experience: f64,
    pub raw_file_ref: RawFileRef,
    /// LLM-inferred soft skills (§4.4 step 3, §9 open question).
    pub inferred_soft_skills: BTreeSet<String>,
}

impl ResumeDto {
    /// §3 invariant: each experience has `startDate ≤ endDate`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.resume_id.trim().is_empty() {
            return Err(ValidationError::MissingField("resumeId".to_string()));
        }
        for exp in &self.work_experience {
            if let Some(end) = exp.end_date {
                if exp.start_date > end {
                    return Err(ValidationError::InvariantViolation(format!(
                        "experience at {:?} has startDate after endDate",
                        exp.company
                    )));
                }
            }
        }
        if self.total_years_experience < 0.0 {
            return Err(ValidationError::InvariantViolation(
                "totalYearsExperience must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub skills: f64,
    pub experience: f64,
    pub education: f64,
    pub soft_skills: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWeights {
    pub skills: f64,
    pub experience: f64,
    pub education: f64,
    pub soft_skills: f64,
}

/// Fixed weights from §4.5 step 5. Never tuned at runtime.
pub const SCORE_WEIGHTS: ScoreWeights = ScoreWeights {
    skills: 0.5,
    experience: 0.25,
    education: 0.15,
    soft_skills: 0.10,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recommendation {
    StrongMatch,
    Match,
    WeakMatch,
    NoMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDto {
    pub job_id: String,
    pub resume_id: String,
    pub overall: f64,
    pub breakdown: ScoreBreakdown,
    pub weights_used: ScoreWeights,
    pub matched_skills: BTreeSet<String>,
    pub missing_mandatory_skills: BTreeSet<String>,
    pub recommendation: Recommendation,
    /// The resume's actual total years of experience, carried alongside
    /// `breakdown.experience` so C6 can tell an under-experienced candidate
    /// (low sub-score, low actual years) apart from an over-qualified one
    /// (low sub-score, high actual years) — the sub-score alone conflates
    /// the two (§4.5, §4.6).
    pub actual_experience_years: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Interview,
    Reject,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDto {
    pub job_id: String,
    pub resume_id: String,
    pub summary: String,
    pub strengths: Vec<String>,
    pub concerns: Vec<String>,
    pub suggestions: Vec<String>,
    pub decision: Decision,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub model_version: String,
}

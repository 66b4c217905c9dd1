//! The vendor LLM collaborator (out of scope per §1, reached only through
//! this narrow trait — §6, §9 "Dynamic dispatch").

pub mod mock;
pub mod openai;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::LlmError;
use crate::pipeline::dto::{ContactInfo, Degree, EducationLevel, Experience, ExperienceYears, SkillRequirement};

/// Fields of `JdDto` the LLM is responsible for (everything but `jobId`,
/// which is supplied by the triggering envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JdExtraction {
    pub required_skills: Vec<SkillRequirement>,
    pub experience_years: ExperienceYears,
    pub education_level: EducationLevel,
    pub soft_skills: BTreeSet<String>,
    pub job_title: String,
}

/// Fields of `ResumeDto` the LLM is responsible for. `totalYearsExperience`
/// is deliberately absent: C4 computes it locally from `workExperience`
/// and never trusts the vendor's arithmetic (§4.4 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeExtraction {
    pub contact_info: ContactInfo,
    pub skills: BTreeSet<String>,
    pub work_experience: Vec<Experience>,
    pub education: Vec<Degree>,
    pub inferred_soft_skills: BTreeSet<String>,
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn extract_jd(&self, jd_text: &str) -> Result<JdExtraction, LlmError>;
    async fn parse_resume(&self, resume_text: &str) -> Result<ResumeExtraction, LlmError>;

    /// Stamped onto `ReportDto.modelVersion` (§6: "mark `ReportDto.modelVersion = \"mock\"`").
    fn model_version(&self) -> &str;
}

/// Select the mock or real adapter based on `LLM_API_KEY` (§6, §9).
pub fn resolve(settings: &Settings) -> Arc<dyn LlmAdapter> {
    if settings.uses_mock_llm() {
        Arc::new(mock::MockLlmAdapter::default())
    } else {
        Arc::new(openai::OpenAiLlmAdapter::new(
            settings.llm_api_key.clone().unwrap_or_default(),
        ))
    }
}

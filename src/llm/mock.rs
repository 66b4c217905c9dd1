//! Deterministic mock LLM adapter, selected when `LLM_API_KEY` is absent
//! or the placeholder `"mock"` (§6): no network calls, fixed-shape
//! responses derived from the input text so tests stay deterministic.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;

use crate::errors::LlmError;
use crate::pipeline::dto::{ContactInfo, Degree, EducationLevel, Experience, ExperienceYears, SkillRequirement};

use super::{JdExtraction, LlmAdapter, ResumeExtraction};

/// A small closed vocabulary the mock scans for. A real vendor would
/// recognize arbitrary skills; this adapter only needs to be
/// deterministic, not comprehensive.
const SKILL_VOCABULARY: &[&str] = &[
    "go", "rust", "python", "java", "kafka", "kubernetes", "docker", "linux",
    "sql", "aws", "terraform", "typescript", "react", "c++", "grpc",
];

const SOFT_SKILL_VOCABULARY: &[&str] = &[
    "leadership", "mentoring", "communication", "teamwork", "adaptability",
    "ownership", "collaboration",
];

#[derive(Debug, Default)]
pub struct MockLlmAdapter;

fn scan_vocabulary(text: &str, vocabulary: &[&str]) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    vocabulary
        .iter()
        .filter(|term| lower.contains(*term))
        .map(|term| term.to_string())
        .collect()
}

/// Find the first "<N> year(s)" pattern and return `N`, defaulting to 3
/// when no such pattern is present — keeps the mock usable on arbitrary
/// free text without a real NLP pass.
fn scan_years(text: &str) -> u32 {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        if word.starts_with("year") {
            if let Some(prev) = i.checked_sub(1).and_then(|j| words.get(j)) {
                let digits: String = prev.chars().filter(|c| c.is_ascii_digit()).collect();
                if let Ok(n) = digits.parse::<u32>() {
                    return n;
                }
            }
        }
    }
    3
}

fn scan_education_level(text: &str) -> EducationLevel {
    let lower = text.to_lowercase();
    if lower.contains("doctorate") || lower.contains("phd") {
        EducationLevel::Doctorate
    } else if lower.contains("master") {
        EducationLevel::Master
    } else if lower.contains("bachelor") {
        EducationLevel::Bachelor
    } else if lower.contains("associate") {
        EducationLevel::Associate
    } else if lower.contains("high school") {
        EducationLevel::HighSchool
    } else {
        EducationLevel::Any
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Untitled")
        .to_string()
}

fn scan_email(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|token| token.contains('@') && token.contains('.'))
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.').to_string())
}

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    async fn extract_jd(&self, jd_text: &str) -> Result<JdExtraction, LlmError> {
        let matched = scan_vocabulary(jd_text, SKILL_VOCABULARY);
        if matched.is_empty() {
            return Err(LlmError::InvalidResponse(
                "no recognizable skills found in job description text".to_string(),
            ));
        }
        let mandatory_count = (matched.len() / 2).max(1);
        let mandatory_weight_each = 1.0 / mandatory_count as f64;
        let optional_weight_each = if matched.len() > mandatory_count {
            0.5 / (matched.len() - mandatory_count) as f64
        } else {
            0.0
        };
        let required_skills = matched
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mandatory = i < mandatory_count;
                SkillRequirement {
                    name: name.clone(),
                    weight: if mandatory { mandatory_weight_each } else { optional_weight_each },
                    mandatory,
                }
            })
            .collect();

        let min_years = scan_years(jd_text);
        Ok(JdExtraction {
            required_skills,
            experience_years: ExperienceYears { min: min_years, max: Some(min_years + 5) },
            education_level: scan_education_level(jd_text),
            soft_skills: scan_vocabulary(jd_text, SOFT_SKILL_VOCABULARY),
            job_title: first_line(jd_text),
        })
    }

    async fn parse_resume(&self, resume_text: &str) -> Result<ResumeExtraction, LlmError> {
        let skills = scan_vocabulary(resume_text, SKILL_VOCABULARY);
        let years = scan_years(resume_text);
        let end = Utc::now().date_naive();
        let start = end - ChronoDuration::days((years as i64) * 365);
        let work_experience = vec![Experience {
            company: "Unknown".to_string(),
            title: "Unknown".to_string(),
            start_date: start,
            end_date: Some(end),
            description: String::new(),
        }];
        let education_level = scan_education_level(resume_text);
        let education = if education_level == EducationLevel::Any {
            vec![]
        } else {
            vec![Degree {
                institution: "Unknown".to_string(),
                field: "Unknown".to_string(),
                level: education_level,
            }]
        };

        Ok(ResumeExtraction {
            contact_info: ContactInfo {
                name: first_line(resume_text),
                email: scan_email(resume_text),
                phone: None,
            },
            skills,
            work_experience,
            education,
            inferred_soft_skills: scan_vocabulary(resume_text, SOFT_SKILL_VOCABULARY),
        })
    }

    fn model_version(&self) -> &str {
        "mock"
    }
}

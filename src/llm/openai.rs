//! Real vendor adapter: a JSON chat-completion call over `reqwest`, with
//! the response coerced into our DTO shape and vendor failures classified
//! per §7.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::LLM_CALL_TIMEOUT_SECONDS;
use crate::errors::LlmError;

use super::{JdExtraction, LlmAdapter, ResumeExtraction};

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiLlmAdapter {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl OpenAiLlmAdapter {
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_CALL_TIMEOUT_SECONDS))
            .build()
            .expect("failed to build reqwest client");
        OpenAiLlmAdapter { api_key, client, model: DEFAULT_MODEL.to_string() }
    }

    async fn call_llm(&self, system_prompt: &str, user_text: &str) -> Result<serde_json::Value, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::InvalidApiKey);
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_text},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Network(format!("request timed out: {}", e))
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimitExceeded);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::InvalidApiKey);
        }
        if status.is_server_error() {
            return Err(LlmError::Network(format!("vendor returned {}", status)));
        }
        if !status.is_success() {
            return Err(LlmError::InvalidResponse(format!("vendor returned {}", status)));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("malformed vendor response: {}", e)))?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))?;

        serde_json::from_str(content)
            .map_err(|e| LlmError::InvalidResponse(format!("content was not valid JSON: {}", e)))
    }
}

#[async_trait]
impl LlmAdapter for OpenAiLlmAdapter {
    async fn extract_jd(&self, jd_text: &str) -> Result<JdExtraction, LlmError> {
        let value = self
            .call_llm(
                "Extract structured requirements from this job description. Respond with JSON matching \
                 {requiredSkills: [{name, weight, mandatory}], experienceYears: {min, max}, \
                 educationLevel, softSkills: [string], jobTitle}.",
                jd_text,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(format!("response did not match JdExtraction shape: {}", e)))
    }

    async fn parse_resume(&self, resume_text: &str) -> Result<ResumeExtraction, LlmError> {
        let value = self
            .call_llm(
                "Extract structured facts from this resume. Respond with JSON matching \
                 {contactInfo: {name, email, phone}, skills: [string], workExperience: \
                 [{company, title, startDate, endDate, description}], education: [{institution, field, level}], \
                 inferredSoftSkills: [string]}.",
                resume_text,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(format!("response did not match ResumeExtraction shape: {}", e)))
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}

//! C4: consumes `job.resume.submitted`, reads the blob from the object
//! store, produces `ResumeDto`, publishes `analysis.resume.parsed` (§4.4).

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::DEFAULT_MAX_FILE_BYTES;
use crate::errors::{ObjectStoreError, PipelineError, ValidationError};
use crate::llm::retry::{retry_with_backoff, RetryConfig};
use crate::llm::LlmAdapter;
use crate::pipeline::bus::Bus;
use crate::pipeline::dto::{Experience, RawFileRef, ResumeDto};
use crate::pipeline::envelope::Envelope;
use crate::pipeline::object_store::ObjectStore;
use crate::pipeline::subjects::ANALYSIS_RESUME_PARSED;
use crate::pipeline::worker::Handler;

/// File-format registry keyed by magic-byte prefix, not extension (§4.4
/// step 2, §9 "dynamic dispatch ... is a small registry keyed by magic-byte
/// prefix").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Pdf,
    Docx,
    LegacyDoc,
    PlainText,
}

fn detect_format(bytes: &[u8]) -> FileFormat {
    if bytes.starts_with(b"%PDF") {
        FileFormat::Pdf
    } else if bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        FileFormat::Docx
    } else if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        FileFormat::LegacyDoc
    } else {
        FileFormat::PlainText
    }
}

fn extract_text(format: FileFormat, bytes: &[u8]) -> Result<String, PipelineError> {
    match format {
        FileFormat::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ValidationError::InvalidFormat(format!("failed to parse PDF: {}", e)).into()),
        FileFormat::Docx => extract_text_from_docx(bytes),
        FileFormat::LegacyDoc => {
            // No legacy OLE2 reader in the stack; best-effort lossy decode
            // rather than rejecting the file outright.
            Ok(String::from_utf8_lossy(bytes)
                .chars()
                .filter(|c| !c.is_control() || c.is_whitespace())
                .collect())
        }
        FileFormat::PlainText => String::from_utf8(bytes.to_vec())
            .map_err(|e| ValidationError::InvalidFormat(format!("not valid UTF-8 text: {}", e)).into()),
    }
}

fn extract_text_from_docx(bytes: &[u8]) -> Result<String, PipelineError> {
    let docx = docx_rs::read_docx(bytes)
        .map_err(|e| ValidationError::InvalidFormat(format!("failed to parse DOCX: {}", e)))?;
    let mut text = String::new();
    for child in &docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            for child in &paragraph.children {
                if let docx_rs::ParagraphChild::Run(run) = child {
                    for child in &run.children {
                        match child {
                            docx_rs::RunChild::Text(t) => text.push_str(&t.text),
                            docx_rs::RunChild::Tab(_) => text.push('\t'),
                            docx_rs::RunChild::Break(_) => text.push('\n'),
                            _ => {}
                        }
                    }
                }
            }
            text.push('\n');
        }
    }
    Ok(text.trim().to_string())
}

/// Merge `Experience` intervals (treating `present` as "now"), sort by
/// start date, union overlapping spans, sum in days/365.25 (§4.4 step 3).
/// Never trusts the LLM's own arithmetic.
pub fn compute_total_years_experience(experiences: &[Experience]) -> f64 {
    if experiences.is_empty() {
        return 0.0;
    }
    let today = chrono::Utc::now().date_naive();
    let mut intervals: Vec<(NaiveDate, NaiveDate)> = experiences
        .iter()
        .map(|e| (e.start_date, e.end_date.unwrap_or(today)))
        .collect();
    intervals.sort_by_key(|(start, _)| *start);

    let mut merged: Vec<(NaiveDate, NaiveDate)> = Vec::new();
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => {
                if end > last.1 {
                    last.1 = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }

    let total_days: i64 = merged.iter().map(|(s, e)| (*e - *s).num_days()).sum();
    total_days as f64 / 365.25
}

fn strip_diacritics(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

/// Lower-case, strip diacritics, collapse whitespace, dedupe (§4.4 step 4).
pub fn normalize_skills(skills: &std::collections::BTreeSet<String>) -> std::collections::BTreeSet<String> {
    skills
        .iter()
        .map(|skill| {
            skill
                .to_lowercase()
                .chars()
                .map(strip_diacritics)
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct ResumeParser {
    conn: Arc<Mutex<Connection>>,
    bus: Arc<dyn Bus>,
    object_store: Arc<dyn ObjectStore>,
    llm: Arc<dyn LlmAdapter>,
    max_file_bytes: u64,
}

impl ResumeParser {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        bus: Arc<dyn Bus>,
        object_store: Arc<dyn ObjectStore>,
        llm: Arc<dyn LlmAdapter>,
    ) -> Self {
        ResumeParser { conn, bus, object_store, llm, max_file_bytes: DEFAULT_MAX_FILE_BYTES }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        if let Some(cached) = self.cached_resume(&envelope.message_id).await? {
            self.publish_parsed(&envelope, cached).await?;
            return Ok(());
        }

        let job_id = envelope.correlation_id.clone();
        let resume_id = envelope
            .payload
            .get("resumeId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValidationError::MissingField("resumeId".to_string()))?
            .to_string();
        let raw_file_ref: RawFileRef = envelope
            .payload
            .get("rawFileRef")
            .cloned()
            .ok_or_else(|| ValidationError::MissingField("rawFileRef".to_string()))
            .and_then(|v| serde_json::from_value(v).map_err(|e| ValidationError::InvalidFormat(e.to_string())))?;

        let stat = self.object_store.stat(&raw_file_ref.file_id).await?;
        if stat.size > self.max_file_bytes {
            return Err(ObjectStoreError::TooLarge { size: stat.size, limit: self.max_file_bytes }.into());
        }
        if stat.checksum != raw_file_ref.checksum {
            return Err(ObjectStoreError::ChecksumMismatch {
                expected: raw_file_ref.checksum.clone(),
                actual: stat.checksum,
            }
            .into());
        }

        // `open_read` re-verifies the checksum against the stored chunks.
        let bytes = self.object_store.open_read(&raw_file_ref.file_id).await?;
        let format = detect_format(&bytes);
        let text = extract_text(format, &bytes)?;

        // Retried in-process before ever reaching the worker harness's
        // nack/backoff (§4.3, §5).
        let extraction = retry_with_backoff(|| self.llm.parse_resume(&text), RetryConfig::default()).await?;
        let total_years_experience = compute_total_years_experience(&extraction.work_experience);
        let skills = normalize_skills(&extraction.skills);

        let resume = ResumeDto {
            resume_id: resume_id.clone(),
            job_id: job_id.clone(),
            contact_info: extraction.contact_info,
            skills,
            work_experience: extraction.work_experience,
            education: extraction.education,
            total_years_experience,
            raw_file_ref,
            inferred_soft_skills: normalize_skills(&extraction.inferred_soft_skills),
        };
        resume.validate()?;

        self.cache_resume(&envelope.message_id, &job_id, &resume_id, &resume).await?;
        self.publish_parsed(&envelope, resume).await?;
        Ok(())
    }

    async fn cached_resume(&self, message_id: &str) -> Result<Option<ResumeDto>, PipelineError> {
        let conn = self.conn.lock().await;
        let row: Option<String> = conn
            .query_row(
                "SELECT resume_dto FROM parse_cache WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| ValidationError::InvalidFormat(format!("corrupt parse cache entry: {}", e)).into()),
        }
    }

    async fn cache_resume(
        &self,
        message_id: &str,
        job_id: &str,
        resume_id: &str,
        resume: &ResumeDto,
    ) -> Result<(), PipelineError> {
        let text = serde_json::to_string(resume).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO parse_cache (message_id, job_id, resume_id, resume_dto, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message_id, job_id, resume_id, text, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn publish_parsed(&self, trigger: &Envelope, resume: ResumeDto) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(&resume).map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;
        let out = Envelope::new(
            ANALYSIS_RESUME_PARSED,
            trigger.correlation_id.clone(),
            trigger.tenant_id.clone(),
            Some(trigger.message_id.clone()),
            payload,
        );
        self.bus.publish(&out).await
    }
}

#[async_trait]
impl Handler for ResumeParser {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        ResumeParser::handle(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::llm::mock::MockLlmAdapter;
    use crate::pipeline::bus::SqliteBus;
    use crate::pipeline::object_store::SqliteObjectStore;
    use crate::pipeline::subjects::{GROUP_SESSION_COORDINATOR, JOB_RESUME_SUBMITTED};

    fn naive(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn detects_pdf_by_magic_bytes_not_extension() {
        assert_eq!(detect_format(b"%PDF-1.4 ..."), FileFormat::Pdf);
    }

    #[test]
    fn detects_docx_zip_signature() {
        assert_eq!(detect_format(&[0x50, 0x4B, 0x03, 0x04, 0, 0]), FileFormat::Docx);
    }

    #[test]
    fn falls_back_to_plain_text() {
        assert_eq!(detect_format(b"Just plain resume text"), FileFormat::PlainText);
    }

    #[test]
    fn total_years_experience_unions_overlapping_intervals() {
        let experiences = vec![
            Experience {
                company: "A".to_string(),
                title: "Eng".to_string(),
                start_date: naive(2018, 1, 1),
                end_date: Some(naive(2020, 1, 1)),
                description: String::new(),
            },
            Experience {
                company: "B".to_string(),
                title: "Eng".to_string(),
                start_date: naive(2019, 6, 1),
                end_date: Some(naive(2021, 1, 1)),
                description: String::new(),
            },
        ];
        // Overlapping: union is 2018-01-01..2021-01-01 = 3 years, not 2+1.5=3.5.
        let years = compute_total_years_experience(&experiences);
        assert!((years - 3.0).abs() < 0.05, "got {}", years);
    }

    #[test]
    fn total_years_experience_sums_disjoint_intervals() {
        let experiences = vec![
            Experience {
                company: "A".to_string(),
                title: "Eng".to_string(),
                start_date: naive(2015, 1, 1),
                end_date: Some(naive(2016, 1, 1)),
                description: String::new(),
            },
            Experience {
                company: "B".to_string(),
                title: "Eng".to_string(),
                start_date: naive(2018, 1, 1),
                end_date: Some(naive(2019, 1, 1)),
                description: String::new(),
            },
        ];
        let years = compute_total_years_experience(&experiences);
        assert!((years - 2.0).abs() < 0.05, "got {}", years);
    }

    #[test]
    fn normalize_skills_lowercases_strips_accents_and_dedupes() {
        let mut skills = std::collections::BTreeSet::new();
        skills.insert("  Go  ".to_string());
        skills.insert("go".to_string());
        skills.insert("Café  Management".to_string());
        let normalized = normalize_skills(&skills);
        assert!(normalized.contains("go"));
        assert!(normalized.contains("cafe management"));
        assert_eq!(normalized.len(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_permanent_failure() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let object_store = Arc::new(SqliteObjectStore::new(conn.clone()));
        let file_id = object_store.put(b"resume bytes", "text/plain").await.unwrap();
        let parser = ResumeParser::new(conn, bus, object_store, Arc::new(MockLlmAdapter::default()));

        let env = Envelope::new(
            JOB_RESUME_SUBMITTED,
            "job-1",
            "org-1",
            None,
            serde_json::json!({
                "jobId": "job-1",
                "resumeId": "r1",
                "rawFileRef": {"fileId": file_id, "checksum": "wrong-checksum"},
                "contentType": "text/plain",
            }),
        );
        let result = parser.handle(env).await;
        assert!(matches!(
            result,
            Err(PipelineError::ObjectStore(ObjectStoreError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn oversized_file_routes_to_dlq_as_permanent_failure() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let object_store = Arc::new(SqliteObjectStore::new(conn.clone()));
        let big = vec![0u8; (DEFAULT_MAX_FILE_BYTES as usize) + 1];
        let checksum = SqliteObjectStore::compute_checksum(&big);
        let file_id = object_store.put(&big, "application/pdf").await.unwrap();
        let parser = ResumeParser::new(conn, bus, object_store, Arc::new(MockLlmAdapter::default()));

        let env = Envelope::new(
            JOB_RESUME_SUBMITTED,
            "job-1",
            "org-1",
            None,
            serde_json::json!({
                "jobId": "job-1",
                "resumeId": "r1",
                "rawFileRef": {"fileId": file_id, "checksum": checksum},
                "contentType": "application/pdf",
            }),
        );
        let result = parser.handle(env).await;
        assert!(matches!(
            result,
            Err(PipelineError::ObjectStore(ObjectStoreError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn successful_parse_publishes_analysis_resume_parsed() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let bus = Arc::new(SqliteBus::new(conn.clone()));
        let object_store = Arc::new(SqliteObjectStore::new(conn.clone()));
        let text = b"Jane Doe\njane@example.com\n5 years of Go and Kubernetes experience.".to_vec();
        let checksum = SqliteObjectStore::compute_checksum(&text);
        let file_id = object_store.put(&text, "text/plain").await.unwrap();
        let parser = ResumeParser::new(conn, bus.clone(), object_store, Arc::new(MockLlmAdapter::default()));

        let env = Envelope::new(
            JOB_RESUME_SUBMITTED,
            "job-1",
            "org-1",
            None,
            serde_json::json!({
                "jobId": "job-1",
                "resumeId": "r1",
                "rawFileRef": {"fileId": file_id, "checksum": checksum},
                "contentType": "text/plain",
            }),
        );
        parser.handle(env).await.unwrap();

        let delivery = bus
            .poll(ANALYSIS_RESUME_PARSED, GROUP_SESSION_COORDINATOR, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let resume: ResumeDto = delivery.envelope.payload_as().unwrap();
        assert_eq!(resume.resume_id, "r1");
        assert!(resume.skills.contains("go"));
    }
}

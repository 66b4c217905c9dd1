//! Plain functions fulfilling the contract an external HTTP admission layer
//! must satisfy (§6). No HTTP server ships in this core — these are the
//! exact operations `POST /jobs`, `POST /jobs/{jobId}/resumes`, and
//! `GET /jobs/{jobId}` are specified to perform, exercised directly by
//! callers (and integration tests) in lieu of a real transport.

use std::sync::Arc;

use crate::errors::PipelineError;
use crate::pipeline::bus::Bus;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::object_store::ObjectStore;
use crate::pipeline::session_coordinator::{SessionCoordinator, SessionSnapshot};
use crate::pipeline::subjects::{JOB_JD_SUBMITTED, JOB_RESUME_SUBMITTED};

/// `POST /jobs` (§6): produces `job.jd.submitted`.
pub async fn submit_job(
    bus: &Arc<dyn Bus>,
    job_id: &str,
    organization_id: &str,
    text: &str,
) -> Result<(), PipelineError> {
    let payload = serde_json::json!({
        "jobId": job_id,
        "organizationId": organization_id,
        "text": text,
        "submittedAt": chrono::Utc::now(),
    });
    let envelope = Envelope::new(JOB_JD_SUBMITTED, job_id, organization_id, None, payload);
    bus.publish(&envelope).await
}

/// `POST /jobs/{jobId}/resumes` (§6): stores the binary in C2, then
/// produces `job.resume.submitted` carrying the checksum C4 will verify.
pub async fn submit_resume(
    bus: &Arc<dyn Bus>,
    object_store: &Arc<dyn ObjectStore>,
    job_id: &str,
    resume_id: &str,
    organization_id: &str,
    bytes: &[u8],
    content_type: &str,
) -> Result<(), PipelineError> {
    let file_id = object_store.put(bytes, content_type).await?;
    let stat = object_store.stat(&file_id).await?;
    let payload = serde_json::json!({
        "jobId": job_id,
        "resumeId": resume_id,
        "rawFileRef": {"fileId": file_id, "checksum": stat.checksum},
        "contentType": content_type,
        "submittedAt": chrono::Utc::now(),
    });
    let envelope = Envelope::new(JOB_RESUME_SUBMITTED, job_id, organization_id, None, payload);
    bus.publish(&envelope).await
}

/// `GET /jobs/{jobId}` (§6): reads the C7 session snapshot. A `Failed`
/// stage carries `lastError`, fulfilling §7's "user-visible failure is
/// exposed by GET /jobs/{jobId}".
pub async fn get_session(
    coordinator: &SessionCoordinator,
    job_id: &str,
) -> Result<Option<SessionSnapshot>, PipelineError> {
    coordinator.snapshot(job_id).await
}

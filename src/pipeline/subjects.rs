//! Subject name constants and DLQ-subject derivation (§4.1).

pub const JOB_JD_SUBMITTED: &str = "job.jd.submitted";
pub const JOB_RESUME_SUBMITTED: &str = "job.resume.submitted";
pub const ANALYSIS_JD_EXTRACTED: &str = "analysis.jd.extracted";
pub const ANALYSIS_RESUME_PARSED: &str = "analysis.resume.parsed";
pub const ANALYSIS_MATCH_SCORED: &str = "analysis.match.scored";
pub const ANALYSIS_REPORT_GENERATED: &str = "analysis.report.generated";

pub const ALL_SUBJECTS: &[&str] = &[
    JOB_JD_SUBMITTED,
    JOB_RESUME_SUBMITTED,
    ANALYSIS_JD_EXTRACTED,
    ANALYSIS_RESUME_PARSED,
    ANALYSIS_MATCH_SCORED,
    ANALYSIS_REPORT_GENERATED,
];

/// Consumer group names (§4.1, §4.3-4.7).
pub const GROUP_JD_EXTRACTORS: &str = "jd-extractors";
pub const GROUP_RESUME_PARSERS: &str = "resume-parsers";
pub const GROUP_SCORING_ENGINES: &str = "scoring-engines";
pub const GROUP_REPORT_GENERATORS: &str = "report-generators";
pub const GROUP_SESSION_COORDINATOR: &str = "session-coordinator";

/// `dlq.<subject>` naming convention used throughout §4 and §7.
pub fn dlq_subject(subject: &str) -> String {
    format!("dlq.{}", subject)
}

/// Fixed pipeline topology: which consumer groups receive a copy of each
/// published subject. The session coordinator observes every subject
/// (§2, §4.7) in addition to each stage's own processing group.
pub fn groups_for_subject(subject: &str) -> Vec<&'static str> {
    if let Some(original) = subject.strip_prefix("dlq.") {
        let _ = original;
        return vec![GROUP_SESSION_COORDINATOR];
    }
    match subject {
        JOB_JD_SUBMITTED => vec![GROUP_JD_EXTRACTORS, GROUP_SESSION_COORDINATOR],
        JOB_RESUME_SUBMITTED => vec![GROUP_RESUME_PARSERS, GROUP_SESSION_COORDINATOR],
        ANALYSIS_JD_EXTRACTED => vec![GROUP_SCORING_ENGINES, GROUP_SESSION_COORDINATOR],
        ANALYSIS_RESUME_PARSED => vec![GROUP_SCORING_ENGINES, GROUP_SESSION_COORDINATOR],
        ANALYSIS_MATCH_SCORED => vec![GROUP_REPORT_GENERATORS, GROUP_SESSION_COORDINATOR],
        ANALYSIS_REPORT_GENERATED => vec![GROUP_SESSION_COORDINATOR],
        _ => vec![GROUP_SESSION_COORDINATOR],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_subject_prefixes() {
        assert_eq!(dlq_subject(JOB_RESUME_SUBMITTED), "dlq.job.resume.submitted");
    }
}

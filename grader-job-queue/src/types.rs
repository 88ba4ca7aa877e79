//! Core types for the job queue system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;

/// Envelope version written by [`encode_job`].
pub const ENVELOPE_VERSION: u32 = 1;

/// Envelope kind for grading jobs.
pub const JOB_KIND: &str = "grader.job";

/// Identifier correlating a queue message with a persisted submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque reference to an uploaded payload in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    #[inline]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The unit of work passed through the queue.
///
/// A job is never mutated after it has been published. Progress is tracked
/// externally, keyed by [`Job::id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub artifact_ref: ArtifactRef,
    pub submission_id: Uuid,
    pub user_id: Uuid,
    pub assessment_id: Uuid,
    /// Diagnostics only. The queue does not order by this.
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Create a job with a freshly generated id.
    pub fn new(
        artifact_ref: ArtifactRef,
        submission_id: Uuid,
        user_id: Uuid,
        assessment_id: Uuid,
    ) -> Self {
        Self::with_id(
            JobId::generate(),
            artifact_ref,
            submission_id,
            user_id,
            assessment_id,
        )
    }

    /// Create a job with a specific id.
    pub fn with_id(
        id: impl Into<JobId>,
        artifact_ref: ArtifactRef,
        submission_id: Uuid,
        user_id: Uuid,
        assessment_id: Uuid,
    ) -> Self {
        Self {
            id: id.into(),
            artifact_ref,
            submission_id,
            user_id,
            assessment_id,
            enqueued_at: Utc::now(),
        }
    }

    /// Time elapsed since the job was enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Result of executing a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Graded { score: u32, detail: String },
    Failed { reason: String },
    Rejected { reason: String },
}

impl JobOutcome {
    #[inline]
    pub fn graded(score: u32, detail: impl Into<String>) -> Self {
        Self::Graded {
            score,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Short lowercase label, used in logs and stats.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Graded { .. } => "graded",
            Self::Failed { .. } => "failed",
            Self::Rejected { .. } => "rejected",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graded { score, .. } => write!(f, "graded({score})"),
            Self::Failed { reason } => write!(f, "failed({reason})"),
            Self::Rejected { reason } => write!(f, "rejected({reason})"),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    version: u32,
    kind: &'a str,
    job: &'a Job,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    kind: String,
    job: Job,
}

/// Serialize a job into the versioned wire envelope.
pub fn encode_job(job: &Job) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EnvelopeOut {
        version: ENVELOPE_VERSION,
        kind: JOB_KIND,
        job,
    })
}

/// Decode a job from its wire envelope.
///
/// Unknown fields are ignored so newer producers can add fields without
/// breaking this consumer. Envelopes from a newer major version are refused.
pub fn decode_job(bytes: &[u8]) -> Result<Job, DecodeError> {
    let envelope: EnvelopeIn = serde_json::from_slice(bytes)?;
    if envelope.version == 0 || envelope.version > ENVELOPE_VERSION {
        return Err(DecodeError::UnsupportedVersion(envelope.version));
    }
    if envelope.kind != JOB_KIND {
        return Err(DecodeError::UnexpectedKind(envelope.kind));
    }
    Ok(envelope.job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::with_id(
            "J1",
            ArtifactRef::new("s3://bucket/a1"),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_envelope_round_trip_keeps_references() {
        let job = sample_job();
        let bytes = encode_job(&job).expect("encode");
        let decoded = decode_job(&bytes).expect("decode");
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_envelope_ignores_unknown_fields() {
        let job = sample_job();
        let payload = json!({
            "version": 1,
            "kind": "grader.job",
            "priority": "high",
            "job": {
                "id": "J1",
                "artifact_ref": "s3://bucket/a1",
                "submission_id": job.submission_id,
                "user_id": job.user_id,
                "assessment_id": job.assessment_id,
                "enqueued_at": job.enqueued_at,
                "language": "rust"
            }
        });
        let decoded = decode_job(payload.to_string().as_bytes()).expect("decode");
        assert_eq!(decoded.id.as_str(), "J1");
        assert_eq!(decoded.artifact_ref.as_str(), "s3://bucket/a1");
        assert_eq!(decoded.assessment_id, job.assessment_id);
    }

    #[test]
    fn test_envelope_rejects_future_version() {
        let job = sample_job();
        let payload = json!({ "version": 2, "kind": "grader.job", "job": job });
        let err = decode_job(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_envelope_rejects_other_kind() {
        let job = sample_job();
        let payload = json!({ "version": 1, "kind": "mail.send", "job": job });
        let err = decode_job(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedKind(kind) if kind == "mail.send"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode_job(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(JobOutcome::graded(100, "all tests passed")).unwrap();
        assert_eq!(value["status"], "graded");
        assert_eq!(value["score"], 100);
        assert_eq!(JobOutcome::failed("boom").label(), "failed");
    }
}

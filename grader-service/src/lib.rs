//! Grading worker service.
//!
//! Wires the job queue, worker pool and lifecycle tracker into a process:
//! [`GraderService`] owns startup and shutdown ordering,
//! [`SubmissionService`] is the producer side, [`CommandGrader`] runs an
//! external grader per job and [`health`] exposes liveness and stats.

pub mod artifacts;
pub mod config_helpers;
pub mod error;
pub mod grading;
pub mod health;
pub mod lifecycle;
pub mod submit;

pub use artifacts::{content_ref, ArtifactStore, FsArtifactStore};
pub use error::{ArtifactError, ServiceError, SubmitError};
pub use grading::CommandGrader;
pub use lifecycle::{GraderService, ServiceDeps};
pub use submit::{Submission, SubmissionService};

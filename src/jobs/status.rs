//! Translation from broker-native states to the public state machine.

use serde::{Deserialize, Serialize};

/// Public job status.
///
/// A job moves `Pending → Processing → {Success, Failure}`; an observed
/// sequence never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl JobStatus {
    /// Map a broker-native state name onto the public state machine.
    ///
    /// Anything unrecognized maps to `Processing` so polling callers never
    /// see an undefined status.
    pub fn from_native(state: &str) -> Self {
        match state {
            "PENDING" => JobStatus::Pending,
            "STARTED" | "PROGRESS" => JobStatus::Processing,
            "SUCCESS" => JobStatus::Success,
            "FAILURE" => JobStatus::Failure,
            _ => JobStatus::Processing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
        };
        write!(f, "{name}")
    }
}

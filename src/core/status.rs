use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::BatchError;

/// Status of a job or step execution.
///
/// The declaration order doubles as the severity order: when child statuses
/// are aggregated into a parent, the parent is at least as severe as its most
/// severe child, and "more severe" means "greater" here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum BatchStatus {
    /// The execution finished successfully.
    Completed,
    /// Created but not yet running.
    #[default]
    Starting,
    /// Currently running.
    Started,
    /// A stop has been requested and is waiting for the running step to
    /// reach a chunk boundary.
    Stopping,
    /// Stopped by request.
    Stopped,
    /// Failed during execution.
    Failed,
    /// Did not stop properly and cannot be restarted.
    Abandoned,
    /// In an uncertain state.
    Unknown,
}

impl BatchStatus {
    /// The more severe of the two statuses.
    pub fn max(self, other: BatchStatus) -> BatchStatus {
        std::cmp::max(self, other)
    }

    /// A non-terminal status: the execution still owns its instance and a
    /// second execution for the same instance must be refused.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "COMPLETED" => Ok(BatchStatus::Completed),
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            "UNKNOWN" => Ok(BatchStatus::Unknown),
            other => Err(BatchError::Configuration(format!(
                "unknown batch status '{other}'"
            ))),
        }
    }
}

/// Free-form exit code plus a human-readable description.
///
/// The reserved codes combine via a "worse of two" rule; anything
/// unrecognized outranks all reserved codes and ties break alphabetically,
/// so custom codes used for flow branching always survive aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    exit_code: String,
    exit_description: String,
}

impl ExitStatus {
    pub fn new(exit_code: &str) -> Self {
        Self {
            exit_code: exit_code.to_string(),
            exit_description: String::new(),
        }
    }

    pub fn completed() -> Self {
        Self::new("COMPLETED")
    }

    pub fn failed() -> Self {
        Self::new("FAILED")
    }

    pub fn stopped() -> Self {
        Self::new("STOPPED")
    }

    pub fn noop() -> Self {
        Self::new("NOOP")
    }

    pub fn unknown() -> Self {
        Self::new("UNKNOWN")
    }

    pub fn executing() -> Self {
        Self::new("EXECUTING")
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    fn severity(&self) -> u8 {
        match self.exit_code.as_str() {
            "NOOP" => 1,
            "EXECUTING" => 2,
            "COMPLETED" => 3,
            "UNKNOWN" => 4,
            "STOPPED" => 5,
            "FAILED" => 6,
            _ => 7,
        }
    }

    /// Combines two statuses, keeping the worse exit code and concatenating
    /// the descriptions.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        let code = match self.severity().cmp(&other.severity()) {
            std::cmp::Ordering::Greater => self.exit_code.clone(),
            std::cmp::Ordering::Less => other.exit_code.clone(),
            // Alphabetical tie-break, relevant only for unrecognized codes.
            std::cmp::Ordering::Equal => {
                std::cmp::max(self.exit_code.clone(), other.exit_code.clone())
            }
        };

        let description = match (
            self.exit_description.is_empty(),
            other.exit_description.is_empty(),
        ) {
            (true, _) => other.exit_description.clone(),
            (_, true) => self.exit_description.clone(),
            (false, false) if self.exit_description == other.exit_description => {
                self.exit_description.clone()
            }
            (false, false) => format!("{}; {}", self.exit_description, other.exit_description),
        };

        ExitStatus {
            exit_code: code,
            exit_description: description,
        }
    }

    /// Returns a copy with the given diagnostic appended to the description.
    pub fn add_exit_description(&self, description: &str) -> ExitStatus {
        let mut status = self.clone();
        if !description.is_empty() && status.exit_description != description {
            if !status.exit_description.is_empty() {
                status.exit_description.push_str("; ");
            }
            status.exit_description.push_str(description);
        }
        status
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl From<BatchStatus> for ExitStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => ExitStatus::completed(),
            BatchStatus::Stopped | BatchStatus::Stopping => ExitStatus::stopped(),
            BatchStatus::Failed | BatchStatus::Abandoned => ExitStatus::failed(),
            BatchStatus::Unknown => ExitStatus::unknown(),
            BatchStatus::Starting | BatchStatus::Started => ExitStatus::executing(),
        }
    }
}

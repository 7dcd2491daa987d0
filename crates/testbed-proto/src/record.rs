//! Execution records exchanged in `exec_status` and `result` messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What an execution does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Command,
    Patch,
    Evaluation,
}

/// State of an execution as last reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Nothing has run yet.
    Idle,
    /// A patch was applied to the checkout.
    PatchApplied,
    /// Work is in progress.
    Running,
    /// Finished with exit code 0.
    Ready,
    /// Finished unsuccessfully. The output holds the diagnostics.
    Failed,
    /// Rejected because another execution is still running.
    Busy,
}

impl ExecutionStatus {
    /// Whether no further updates will follow for this execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PatchApplied | Self::Ready | Self::Failed | Self::Busy
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::PatchApplied => "patch_applied",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// One command, patch or evaluation together with its latest status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub kind: ExecutionKind,
    pub status: ExecutionStatus,
    /// Captured output, stdout followed by stderr.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Why the execution failed or was rejected, when known.
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// A record for work that has just started.
    pub fn running(execution_id: Uuid, kind: ExecutionKind) -> Self {
        Self {
            execution_id,
            kind,
            status: ExecutionStatus::Running,
            output: String::new(),
            exit_code: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A rejection for a request that arrived while `running` was in flight.
    pub fn busy(execution_id: Uuid, kind: ExecutionKind, running: Uuid) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            kind,
            status: ExecutionStatus::Busy,
            output: String::new(),
            exit_code: None,
            error: Some(format!("execution {running} is still running")),
            started_at: now,
            finished_at: Some(now),
        }
    }

    /// Close the record with a final status.
    pub fn finish(
        mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        output: String,
    ) -> Self {
        self.status = status;
        self.exit_code = exit_code;
        self.output = output;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Close the record as failed without output from the work itself.
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Failed;
        self.error = Some(reason.into());
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Finished and did what was asked.
    pub fn success(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Ready | ExecutionStatus::PatchApplied
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Idle.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Ready.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::PatchApplied.is_terminal());
        assert!(ExecutionStatus::Busy.is_terminal());
    }

    #[test]
    fn test_finish_sets_completion() {
        let id = Uuid::new_v4();
        let record = ExecutionRecord::running(id, ExecutionKind::Command).finish(
            ExecutionStatus::Failed,
            Some(2),
            "boom".into(),
        );
        assert_eq!(record.execution_id, id);
        assert_eq!(record.exit_code, Some(2));
        assert!(record.finished_at.is_some());
        assert!(!record.success());
    }

    #[test]
    fn test_busy_names_running_execution() {
        let running = Uuid::new_v4();
        let record = ExecutionRecord::busy(Uuid::new_v4(), ExecutionKind::Command, running);
        assert_eq!(record.status, ExecutionStatus::Busy);
        assert!(record.error.unwrap().contains(&running.to_string()));
    }
}

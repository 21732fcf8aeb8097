use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{symbol}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub symbol: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Per-symbol unit of work: pending → running → {done, failed}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub symbol: String,
    status: JobStatus,
    error: Option<String>,
}

impl ScanJob {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            status: JobStatus::Pending,
            error: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, expected: JobStatus, to: JobStatus) -> Result<(), InvalidTransition> {
        if self.status != expected {
            return Err(InvalidTransition {
                symbol: self.symbol.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Pending, JobStatus::Running)
    }

    pub fn finish(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Running, JobStatus::Done)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Running, JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;

pub type TaskId = Uuid;
pub type GpuId = u32;
pub type WorkerId = String;

/// One megabyte as used by every `_mb` configuration field.
pub const MB: u64 = 1024 * 1024;

/// Task priority class. Lower numeric value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// CRITICAL and HIGH tasks may skip ahead of blocked entries in the
    /// scheduler's lookahead window.
    pub fn is_urgent(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            other => Err(SchedulerError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Kind of simulation job. Drives the memory multiplier and default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Optimization,
    Stability,
    BulkModulus,
    HeatCapacity,
    InteractionEnergy,
    SinglePoint,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Optimization,
        JobKind::Stability,
        JobKind::BulkModulus,
        JobKind::HeatCapacity,
        JobKind::InteractionEnergy,
        JobKind::SinglePoint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Optimization => "optimization",
            JobKind::Stability => "stability",
            JobKind::BulkModulus => "bulk-modulus",
            JobKind::HeatCapacity => "heat-capacity",
            JobKind::InteractionEnergy => "interaction-energy",
            JobKind::SinglePoint => "single-point",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SchedulerError::Validation(format!("unknown job kind '{s}'")))
    }
}

/// Task lifecycle status. See `mofsim_scheduler::lifecycle::fsm` for the
/// allowed edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// ASSIGNED and RUNNING tasks hold a GPU and a worker.
    pub fn holds_gpu(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuStatus {
    Free,
    Busy,
    Error,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Alive,
    Suspect,
    Dead,
}

/// Why a task ended up FAILED (or TIMEOUT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The worker ran out of GPU memory and the retry budget is spent.
    OutOfMemory,
    /// The bound worker stopped heartbeating.
    WorkerOffline,
    /// The task ran past its deadline.
    Timeout,
    /// The computation itself failed (reported by the worker).
    Execution,
    /// Scheduler-side inconsistency, isolated to this task.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::WorkerOffline => "worker_offline",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Execution => "execution",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::Critical as u8, 0);
        assert_eq!(Priority::Low as u8, 3);
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("LOW".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!(matches!(
            "phonon".parse::<JobKind>(),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn job_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&JobKind::HeatCapacity).unwrap();
        assert_eq!(json, "\"heat-capacity\"");
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Timeout,
                TaskStatus::Cancelled
            ]
        );
        assert!(TaskStatus::Running.holds_gpu());
        assert!(!TaskStatus::Queued.holds_gpu());
    }
}

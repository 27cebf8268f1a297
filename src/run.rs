//! Types for run records: steps, history, and terminal outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::action::Action;
use crate::device::ExecResult;

/// One loop iteration's full record.
///
/// Immutable once appended to the history. Screenshot pixel data is not
/// retained here; only its dimensions and, when a session is attached,
/// the path it was persisted to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step index (0-based)
    pub index: usize,

    /// Dimensions of the screenshot the planner was shown
    pub screen_width: u32,
    pub screen_height: u32,

    /// Path the screenshot was saved to (if a session is attached)
    pub screenshot_path: Option<PathBuf>,

    /// Raw planner output for this step
    pub planned_raw: String,

    /// The validated action, absent when validation failed
    pub action: Option<Action>,

    /// Device execution result, absent for terminal and invalid actions
    pub exec: Option<ExecResult>,

    /// Validation failure text, when the planner output was rejected
    pub error: Option<String>,

    /// Timestamp when the step was recorded
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Ordered, append-only record of all steps taken in a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    steps: Vec<Step>,
}

impl History {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// The trailing window of at most `n` steps, oldest first
    pub fn tail(&self, n: usize) -> &[Step] {
        let start = self.steps.len().saturating_sub(n);
        &self.steps[start..]
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    /// The planner declared the task complete
    Completed { summary: String },
    /// The step budget was exhausted before completion
    StepLimitExceeded,
    /// The run was stopped: planner gave up, an unrecoverable error, or
    /// an external stop request
    Aborted { reason: String },
    /// The device dropped off the transport
    DeviceUnavailable,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Completed { .. })
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Completed { summary } => write!(f, "completed: {}", summary),
            RunResult::StepLimitExceeded => write!(f, "step limit exceeded"),
            RunResult::Aborted { reason } => write!(f, "aborted: {}", reason),
            RunResult::DeviceUnavailable => write!(f, "device unavailable"),
        }
    }
}

/// Event pushed to the presentation side as the run progresses.
///
/// Delivered over a single-producer channel in completion order; one
/// `Completed` per step, then exactly one `Finished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepEvent {
    Completed(Step),
    Finished(RunResult),
}

/// A finished run: the terminal outcome plus the full step record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub result: RunResult,
    pub history: History,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize) -> Step {
        Step {
            index,
            screen_width: 1080,
            screen_height: 2400,
            screenshot_path: None,
            planned_raw: String::new(),
            action: None,
            exec: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_tail() {
        let mut history = History::new();
        for i in 0..5 {
            history.push(step(i));
        }
        let tail = history.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 3);
        assert_eq!(tail[1].index, 4);

        // Window larger than the history returns everything
        assert_eq!(history.tail(100).len(), 5);
    }

    #[test]
    fn test_run_result_display() {
        let result = RunResult::Completed {
            summary: "opened settings".to_string(),
        };
        assert!(result.is_success());
        assert_eq!(result.to_string(), "completed: opened settings");
        assert!(!RunResult::DeviceUnavailable.is_success());
    }

    #[test]
    fn test_history_serializes_as_array() {
        let mut history = History::new();
        history.push(step(0));
        let json = serde_json::to_value(&history).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 1);
    }
}

//! Phone Pilot - vision-model-driven Android automation.
//!
//! This crate provides:
//! - An ADB device controller for screen capture and input injection
//! - A vision-language planner with remote and local backends
//! - A validation boundary turning free-form model output into a closed
//!   action set
//! - The perception-action agent loop tying them together
//! - Session management for run artifacts
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//! use phone_pilot::agent::AgentLoop;
//! use phone_pilot::device::AdbDevice;
//! use phone_pilot::planner::RemotePlanner;
//!
//! let device = AdbDevice::new(None);
//! let planner = RemotePlanner::from_config();
//! let (tx, rx) = mpsc::channel();
//! let mut agent = AgentLoop::new(Box::new(device), Box::new(planner)).with_events(tx);
//! let record = agent.run("open settings");
//! drop(rx);
//! println!("{}", record.result);
//! ```

pub mod action;
pub mod agent;
pub mod config;
pub mod device;
pub mod planner;
pub mod run;
pub mod session;

// Re-export the action schema
pub use action::{Action, ValidationError, ValidationResult, validate};

// Re-export the agent loop
pub use agent::{AgentConfig, AgentLoop, StopHandle};

// Re-export device types and controllers
pub use device::{
    AdbDevice, DeviceController, DeviceError, DeviceId, DeviceResult, ExecResult, MockDevice,
    Screenshot, list_devices,
};

// Re-export planner types and backends
pub use planner::{LocalPlanner, PlannedAction, Planner, PlannerError, PlannerResult, RemotePlanner};

// Re-export run records
pub use run::{History, RunRecord, RunResult, Step, StepEvent};

// Re-export session management
pub use session::{Session, cleanup_old_sessions, list_sessions};

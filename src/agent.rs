//! The perception-action agent loop.
//!
//! One run drives a device toward a natural-language task: capture the
//! screen, ask the planner for the next action, validate it, execute it,
//! record the step, repeat. The loop owns the step budget, the retry
//! policy for transient failures, termination detection, and the
//! exclusive device lease. It is strictly sequential; the only
//! suspension points are the (deadline-bounded) planner and device calls.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use crate::action::{self, Action};
use crate::config;
use crate::device::{self, DeviceController, DeviceError, DeviceResult, Screenshot};
use crate::planner::{PlannedAction, Planner, PlannerError, PlannerResult};
use crate::run::{History, RunRecord, RunResult, Step, StepEvent};
use crate::session::Session;

/// Default total attempts per transient failure (first try included)
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default backoff multiplier between attempts
pub const DEFAULT_RETRY_FACTOR: u32 = 2;

/// Default number of re-prompts after a rejected action
pub const DEFAULT_VALIDATION_RETRIES: u32 = 1;

/// Tunables for one run.
///
/// The retry constants are explicit defaults, not invariants; anything
/// embedding the loop can tighten or loosen them.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Step budget; the run never records more steps than this
    pub max_steps: usize,
    /// Total attempts for a transient planner/device failure
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub retry_base_delay: Duration,
    /// Backoff multiplier between attempts
    pub retry_factor: u32,
    /// How many times a rejected action is re-prompted before aborting
    pub validation_retries: u32,
    /// Print step progress to stderr
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: config::get().agent.max_steps,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_factor: DEFAULT_RETRY_FACTOR,
            validation_retries: DEFAULT_VALIDATION_RETRIES,
            verbose: false,
        }
    }
}

/// Handle for requesting a stop from another thread.
///
/// Honored before the next planning or execution phase; an action already
/// in flight on the device finishes first so the device is never left
/// mid-gesture.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The agent loop orchestrator
pub struct AgentLoop {
    device: Box<dyn DeviceController>,
    planner: Box<dyn Planner>,
    config: AgentConfig,
    session: Option<Session>,
    events: Option<mpsc::Sender<StepEvent>>,
    stop: Arc<AtomicBool>,
}

impl AgentLoop {
    pub fn new(device: Box<dyn DeviceController>, planner: Box<dyn Planner>) -> Self {
        Self {
            device,
            planner,
            config: AgentConfig::default(),
            session: None,
            events: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a session; screenshots and the step record are persisted
    /// into its directory
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a channel for the ordered step stream. Consumers receive
    /// one `Completed` per step and exactly one `Finished`, in order.
    pub fn with_events(mut self, sender: mpsc::Sender<StepEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Get a handle that can stop this run from another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Execute the loop for `task` until a terminal outcome
    pub fn run(&mut self, task: &str) -> RunRecord {
        let mut history = History::new();

        // One active run per device; a competing run fails immediately
        // instead of interleaving actions on the same transport
        let _lease = match device::claim_device(self.device.device_id()) {
            Some(lease) => lease,
            None => {
                let reason = format!(
                    "device '{}' is already claimed by another run",
                    self.device.device_id()
                );
                return self.finish(history, RunResult::Aborted { reason });
            }
        };

        if let Some(session) = &self.session {
            if let Err(e) = session.init(task, self.device.device_id()) {
                eprintln!("Warning: failed to initialize session: {}", e);
            }
        }

        let mut consecutive_rejections = 0u32;

        let result = loop {
            // -- Planning: observe the screen, ask for the next action --
            if self.stop.load(Ordering::SeqCst) {
                break RunResult::Aborted {
                    reason: "stop requested".to_string(),
                };
            }
            if history.len() >= self.config.max_steps {
                break RunResult::StepLimitExceeded;
            }

            let screenshot = match self.capture_with_retry() {
                Ok(shot) => shot,
                Err(DeviceError::Disconnected(_)) => break RunResult::DeviceUnavailable,
                Err(e) => {
                    break RunResult::Aborted {
                        reason: e.to_string(),
                    };
                }
            };

            let screenshot_path = self
                .session
                .as_ref()
                .and_then(|s| s.save_screenshot(history.len(), &screenshot.png_data).ok());

            let planned = match self.plan_with_retry(task, &history, &screenshot) {
                Ok(planned) => planned,
                Err(e) => {
                    break RunResult::Aborted {
                        reason: e.to_string(),
                    };
                }
            };

            // -- Validating: normalize raw output into the closed set --
            let mut step = Step {
                index: history.len(),
                screen_width: screenshot.width,
                screen_height: screenshot.height,
                screenshot_path,
                planned_raw: planned.raw.clone(),
                action: None,
                exec: None,
                error: None,
                timestamp: Utc::now(),
            };

            let validated = action::validate(&planned.raw, screenshot.width, screenshot.height);
            let act = match validated {
                Ok(act) => {
                    consecutive_rejections = 0;
                    step.action = Some(act.clone());
                    act
                }
                Err(err) => {
                    consecutive_rejections += 1;
                    step.error = Some(err.to_string());
                    self.record(&mut history, step);
                    if consecutive_rejections > self.config.validation_retries {
                        break RunResult::Aborted {
                            reason: format!("planner kept proposing invalid actions: {}", err),
                        };
                    }
                    // The rejection is now part of the history the
                    // planner sees on the re-prompt
                    continue;
                }
            };

            if self.config.verbose {
                eprintln!("step {}: {}", step.index + 1, act);
            }

            match &act {
                Action::Done { summary } => {
                    let summary = summary.clone();
                    self.record(&mut history, step);
                    break RunResult::Completed { summary };
                }
                Action::Fail { reason } => {
                    let reason = reason.clone();
                    self.record(&mut history, step);
                    break RunResult::Aborted { reason };
                }
                _ => {}
            }

            // -- Executing: stop requests are honored before the device
            // is touched; once issued, an action always finishes --
            if self.stop.load(Ordering::SeqCst) {
                self.record(&mut history, step);
                break RunResult::Aborted {
                    reason: "stop requested".to_string(),
                };
            }

            let exec = self.device.execute(&act);
            let disconnected = exec.disconnected;
            step.exec = Some(exec);
            self.record(&mut history, step);

            if disconnected {
                break RunResult::DeviceUnavailable;
            }
            if history.len() >= self.config.max_steps {
                break RunResult::StepLimitExceeded;
            }
        };

        self.finish(history, result)
    }

    /// Capture the screen, retrying timeouts with backoff. Disconnects
    /// and unknown failures surface immediately.
    fn capture_with_retry(&mut self) -> DeviceResult<Screenshot> {
        let mut attempt = 1;
        loop {
            match self.device.capture_screen() {
                Ok(shot) => return Ok(shot),
                Err(DeviceError::Timeout(d)) if attempt < self.config.retry_attempts => {
                    if self.config.verbose {
                        eprintln!("capture timed out after {:?}, retrying", d);
                    }
                    self.backoff(attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the planner for an action, retrying transient failures with
    /// backoff. A malformed response is re-requested once; auth failures
    /// surface immediately.
    fn plan_with_retry(
        &self,
        task: &str,
        history: &History,
        screenshot: &Screenshot,
    ) -> PlannerResult<PlannedAction> {
        let mut attempt = 1;
        let mut malformed_retried = false;
        loop {
            match self.planner.plan(task, history, screenshot) {
                Ok(planned) => return Ok(planned),
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts => {
                    if self.config.verbose {
                        eprintln!("planner failed ({}), retrying", e);
                    }
                    self.backoff(attempt);
                    attempt += 1;
                }
                Err(PlannerError::Malformed(msg)) if !malformed_retried => {
                    if self.config.verbose {
                        eprintln!("planner response malformed ({}), re-requesting", msg);
                    }
                    malformed_retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) {
        let factor = self.config.retry_factor.saturating_pow(attempt - 1);
        std::thread::sleep(self.config.retry_base_delay.saturating_mul(factor));
    }

    /// Append a step and mirror it onto the event stream
    fn record(&self, history: &mut History, step: Step) {
        self.emit(StepEvent::Completed(step.clone()));
        history.push(step);
    }

    fn finish(&self, history: History, result: RunResult) -> RunRecord {
        if let Some(session) = &self.session {
            if let Err(e) = session.save_history(&history) {
                eprintln!("Warning: failed to persist step record: {}", e);
            }
        }
        self.emit(StepEvent::Finished(result.clone()));
        RunRecord { result, history }
    }

    fn emit(&self, event: StepEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    struct NeverPlanner;

    impl Planner for NeverPlanner {
        fn plan(
            &self,
            _task: &str,
            _history: &History,
            _screenshot: &Screenshot,
        ) -> PlannerResult<PlannedAction> {
            panic!("planner should not be reached");
        }

        fn backend(&self) -> &str {
            "never"
        }
    }

    #[test]
    fn test_stop_honored_before_any_device_call() {
        let device = MockDevice::new("agent-test-stop");
        let mut agent = AgentLoop::new(Box::new(device), Box::new(NeverPlanner));
        agent.stop_handle().stop();

        let record = agent.run("open settings");
        assert!(matches!(record.result, RunResult::Aborted { .. }));
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(config.validation_retries, DEFAULT_VALIDATION_RETRIES);
        assert!(config.max_steps > 0);
    }
}

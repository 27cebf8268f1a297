//! Integration tests for the agent loop state machine

use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use phone_pilot::action::{Action, validate};
use phone_pilot::agent::{AgentConfig, AgentLoop};
use phone_pilot::device::{DeviceError, ExecResult, MockDevice, Screenshot, claim_device};
use phone_pilot::planner::{PlannedAction, Planner, PlannerError, PlannerResult};
use phone_pilot::run::{History, RunResult, StepEvent};

/// Planner that replays a script of responses. Once the script is
/// exhausted the last entry repeats, so "always does X" scenarios are a
/// one-entry script.
struct ScriptedPlanner {
    responses: Mutex<Vec<PlannerResult<PlannedAction>>>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    fn new(responses: Vec<PlannerResult<PlannedAction>>) -> Arc<Self> {
        assert!(!responses.is_empty());
        Arc::new(Self {
            responses: Mutex::new(responses),
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Boxable handle so tests keep the script observable after the move
struct SharedPlanner(Arc<ScriptedPlanner>);

impl Planner for SharedPlanner {
    fn plan(
        &self,
        _task: &str,
        _history: &History,
        _screenshot: &Screenshot,
    ) -> PlannerResult<PlannedAction> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.0.responses.lock().unwrap();
        let idx = self
            .0
            .cursor
            .fetch_add(1, Ordering::SeqCst)
            .min(responses.len() - 1);
        responses[idx].clone()
    }

    fn backend(&self) -> &str {
        "scripted"
    }
}

fn planned(raw: &str) -> PlannerResult<PlannedAction> {
    Ok(PlannedAction {
        raw: raw.to_string(),
    })
}

fn tap_raw(x: u32, y: u32) -> PlannerResult<PlannedAction> {
    planned(&format!(r#"{{"action": "tap", "x": {}, "y": {}}}"#, x, y))
}

fn done_raw(summary: &str) -> PlannerResult<PlannedAction> {
    planned(&format!(r#"{{"action": "done", "summary": "{}"}}"#, summary))
}

/// Retry config with millisecond backoff so tests stay fast
fn fast_config(max_steps: usize) -> AgentConfig {
    AgentConfig {
        max_steps,
        retry_base_delay: Duration::from_millis(1),
        ..AgentConfig::default()
    }
}

fn agent_with(
    device: MockDevice,
    planner: &Arc<ScriptedPlanner>,
    config: AgentConfig,
) -> AgentLoop {
    AgentLoop::new(
        Box::new(device),
        Box::new(SharedPlanner(Arc::clone(planner))),
    )
    .with_config(config)
}

#[test]
fn test_completed_run_records_every_step() {
    // Tap then done: two steps, one terminal Completed
    let planner = ScriptedPlanner::new(vec![tap_raw(500, 800), done_raw("opened settings")]);
    let device = MockDevice::new("it-completed");
    let exec_log = device.exec_log();

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert_eq!(
        record.result,
        RunResult::Completed {
            summary: "opened settings".to_string()
        }
    );
    assert_eq!(record.history.len(), 2);

    // Only the tap reached the device; done is terminal
    let executed = exec_log.lock().unwrap();
    assert_eq!(executed.as_slice(), &[Action::Tap { x: 500, y: 800 }]);
}

#[test]
fn test_step_limit_exceeded() {
    // A planner that never finishes runs into the step budget
    let planner = ScriptedPlanner::new(vec![tap_raw(100, 100)]);
    let device = MockDevice::new("it-limit");

    let mut agent = agent_with(device, &planner, fast_config(3));
    let record = agent.run("scroll forever");

    assert_eq!(record.result, RunResult::StepLimitExceeded);
    assert_eq!(record.history.len(), 3);
}

#[test]
fn test_device_unavailable_on_first_capture() {
    let planner = ScriptedPlanner::new(vec![tap_raw(1, 1)]);
    let device = MockDevice::new("it-gone")
        .fail_next_capture(DeviceError::Disconnected("usb unplugged".to_string()));

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert_eq!(record.result, RunResult::DeviceUnavailable);
    assert!(record.history.is_empty());
    assert_eq!(planner.calls(), 0);
}

#[test]
fn test_unknown_action_reprompted_once_then_aborts() {
    let planner = ScriptedPlanner::new(vec![planned(r#"{"action": "teleport", "x": 1, "y": 2}"#)]);
    let device = MockDevice::new("it-unknown");
    let exec_log = device.exec_log();

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(matches!(record.result, RunResult::Aborted { .. }));
    // First rejection plus one re-prompt, both recorded
    assert_eq!(record.history.len(), 2);
    assert_eq!(planner.calls(), 2);
    for step in record.history.iter() {
        assert!(step.action.is_none());
        assert!(step.error.as_deref().unwrap().contains("teleport"));
    }
    assert!(exec_log.lock().unwrap().is_empty());
}

#[test]
fn test_validation_failure_recovers_on_reprompt() {
    let planner = ScriptedPlanner::new(vec![
        planned(r#"{"action": "teleport"}"#),
        tap_raw(10, 10),
        done_raw("done"),
    ]);
    let device = MockDevice::new("it-recover");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(record.result.is_success());
    assert_eq!(record.history.len(), 3);
}

#[test]
fn test_out_of_bounds_tap_never_reaches_device() {
    // 1080x2400 screen; x=5000 is far outside
    let planner = ScriptedPlanner::new(vec![tap_raw(5000, 100), done_raw("gave up")]);
    let device = MockDevice::new("it-oob");
    let exec_log = device.exec_log();

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(record.result.is_success());
    let first = record.history.iter().next().unwrap();
    assert!(first.error.as_deref().unwrap().contains("outside screen bounds"));
    assert!(exec_log.lock().unwrap().is_empty());
}

#[test]
fn test_rate_limit_retry_bound() {
    let planner = ScriptedPlanner::new(vec![Err(PlannerError::RateLimited)]);
    let device = MockDevice::new("it-rate");

    let mut config = fast_config(100);
    config.retry_attempts = 3;
    let mut agent = agent_with(device, &planner, config);
    let record = agent.run("open settings");

    assert!(matches!(record.result, RunResult::Aborted { .. }));
    // Exactly the configured number of attempts, no more
    assert_eq!(planner.calls(), 3);
    assert!(record.history.is_empty());
}

#[test]
fn test_auth_failure_aborts_without_retry() {
    let planner = ScriptedPlanner::new(vec![Err(PlannerError::AuthFailure(
        "invalid api key".to_string(),
    ))]);
    let device = MockDevice::new("it-auth");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    match record.result {
        RunResult::Aborted { reason } => assert!(reason.contains("invalid api key")),
        other => panic!("expected Aborted, got {:?}", other),
    }
    assert_eq!(planner.calls(), 1);
}

#[test]
fn test_malformed_response_rerequested_once() {
    let planner = ScriptedPlanner::new(vec![
        Err(PlannerError::Malformed("truncated".to_string())),
        done_raw("ok"),
    ]);
    let device = MockDevice::new("it-malformed-once");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(record.result.is_success());
    assert_eq!(planner.calls(), 2);
}

#[test]
fn test_persistent_malformed_aborts() {
    let planner = ScriptedPlanner::new(vec![Err(PlannerError::Malformed(
        "not a completion".to_string(),
    ))]);
    let device = MockDevice::new("it-malformed");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(matches!(record.result, RunResult::Aborted { .. }));
    // Initial request plus the single re-request
    assert_eq!(planner.calls(), 2);
}

#[test]
fn test_exec_failure_is_recorded_and_loop_continues() {
    let planner = ScriptedPlanner::new(vec![tap_raw(10, 10), done_raw("ok")]);
    let device =
        MockDevice::new("it-exec-fail").queue_exec_result(ExecResult::failed("screen locked"));

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(record.result.is_success());
    let first = record.history.iter().next().unwrap();
    let exec = first.exec.as_ref().unwrap();
    assert!(!exec.success);
    assert_eq!(exec.message.as_deref(), Some("screen locked"));
}

#[test]
fn test_exec_disconnect_terminates_run() {
    let planner = ScriptedPlanner::new(vec![tap_raw(10, 10)]);
    let device = MockDevice::new("it-exec-gone")
        .queue_exec_result(ExecResult::disconnected("device offline"));

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert_eq!(record.result, RunResult::DeviceUnavailable);
    assert_eq!(record.history.len(), 1);
}

#[test]
fn test_capture_timeout_retried_then_recovers() {
    let planner = ScriptedPlanner::new(vec![done_raw("ok")]);
    let device = MockDevice::new("it-capture-retry")
        .fail_next_capture(DeviceError::Timeout(Duration::from_secs(1)));

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert!(record.result.is_success());
}

#[test]
fn test_second_run_on_claimed_device_fails_immediately() {
    let _held = claim_device("it-busy").unwrap();

    let planner = ScriptedPlanner::new(vec![done_raw("ok")]);
    let device = MockDevice::new("it-busy");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    match record.result {
        RunResult::Aborted { reason } => assert!(reason.contains("already claimed")),
        other => panic!("expected Aborted, got {:?}", other),
    }
    assert!(record.history.is_empty());
    assert_eq!(planner.calls(), 0);
}

#[test]
fn test_device_released_after_run() {
    let planner = ScriptedPlanner::new(vec![done_raw("ok")]);
    let device = MockDevice::new("it-release");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");
    assert!(record.result.is_success());

    // The lease is gone once the run finished
    let lease = claim_device("it-release");
    assert!(lease.is_some());
}

#[test]
fn test_step_events_arrive_in_order_without_duplicates() {
    let planner = ScriptedPlanner::new(vec![tap_raw(1, 1), tap_raw(2, 2), done_raw("ok")]);
    let device = MockDevice::new("it-events");

    let (tx, rx) = mpsc::channel();
    let mut agent = agent_with(device, &planner, fast_config(100)).with_events(tx);
    let record = agent.run("open settings");
    drop(agent);

    let events: Vec<StepEvent> = rx.iter().collect();
    assert_eq!(events.len(), record.history.len() + 1);

    for (i, event) in events.iter().take(record.history.len()).enumerate() {
        match event {
            StepEvent::Completed(step) => assert_eq!(step.index, i),
            other => panic!("expected step event at {}, got {:?}", i, other),
        }
    }
    match events.last().unwrap() {
        StepEvent::Finished(result) => assert_eq!(*result, record.result),
        other => panic!("expected finish event, got {:?}", other),
    }
}

#[test]
fn test_validation_is_deterministic_over_recorded_history() {
    let planner = ScriptedPlanner::new(vec![
        tap_raw(500, 800),
        planned(r#"{"action": "swipe", "start": [540, 1800], "end": [540, 600]}"#),
        done_raw("ok"),
    ]);
    let device = MockDevice::new("it-replay");

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");
    assert!(record.result.is_success());

    // Replaying every recorded raw output yields the recorded action
    for step in record.history.iter() {
        let replayed = validate(&step.planned_raw, step.screen_width, step.screen_height).unwrap();
        assert_eq!(step.action.as_ref(), Some(&replayed));
    }
}

#[test]
fn test_history_never_exceeds_budget() {
    for max_steps in [1, 2, 5] {
        let planner = ScriptedPlanner::new(vec![tap_raw(1, 1)]);
        let device = MockDevice::new(format!("it-budget-{}", max_steps));
        let mut agent = agent_with(device, &planner, fast_config(max_steps));
        let record = agent.run("never ends");
        assert!(record.history.len() <= max_steps);
        assert_eq!(record.result, RunResult::StepLimitExceeded);
    }
}

#[test]
fn test_planner_given_fail_action_aborts_with_reason() {
    let planner = ScriptedPlanner::new(vec![planned(
        r#"{"action": "fail", "reason": "app not installed"}"#,
    )]);
    let device = MockDevice::new("it-fail-action");
    let exec_log = device.exec_log();

    let mut agent = agent_with(device, &planner, fast_config(100));
    let record = agent.run("open settings");

    assert_eq!(
        record.result,
        RunResult::Aborted {
            reason: "app not installed".to_string()
        }
    );
    assert_eq!(record.history.len(), 1);
    assert!(exec_log.lock().unwrap().is_empty());
}

//! ADB-backed device controller.
//!
//! Drives a connected Android device through the `adb` binary: screen
//! capture via `screencap`, gestures via `input`, and text entry through
//! the ADB Keyboard broadcast (base64 payload, so non-ASCII text survives
//! the shell). Every invocation is bounded by a deadline; a stalled adb
//! process is killed and reported as a timeout.
//!
//! # Configuration
//!
//! The adb binary location can be overridden with `PHONE_PILOT_ADB_PATH`.

use base64::Engine;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::action::Action;
use crate::config;

use super::DeviceController;
use super::types::{DeviceError, DeviceId, DeviceResult, ExecResult, Screenshot};

/// Remote path the device writes captures to before they are pulled
const REMOTE_CAPTURE_PATH: &str = "/sdcard/phone_pilot_capture.png";

/// Fallback screen dimensions when the device refuses a capture
const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;

/// IME component of the ADB Keyboard app
const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// List devices currently visible to adb
pub fn list_devices() -> DeviceResult<Vec<DeviceId>> {
    let output = run_bounded(
        Command::new(config::get().device.adb_path.as_str()).arg("devices"),
        Duration::from_secs(5),
    )?;
    Ok(parse_devices_output(&output.stdout))
}

/// Parse `adb devices` output into device ids
fn parse_devices_output(stdout: &str) -> Vec<DeviceId> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(id), Some("device")) => Some(id.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Device controller for an adb-connected Android device
pub struct AdbDevice {
    adb_path: String,
    device_id: Option<String>,
    command_timeout: Duration,
    /// Original IME, saved the first time text entry switches keyboards
    saved_ime: Option<String>,
}

impl AdbDevice {
    /// Create a controller for the given device id, or the default device
    /// when `None` (single-device setups)
    pub fn new(device_id: Option<String>) -> Self {
        let cfg = config::get();
        Self {
            adb_path: cfg.device.adb_path.clone(),
            device_id,
            command_timeout: Duration::from_secs(cfg.device.command_timeout),
            saved_ime: None,
        }
    }

    /// Override the per-command deadline
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Build an adb command with the device selector applied
    fn adb(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(id) = &self.device_id {
            cmd.args(["-s", id]);
        }
        cmd.args(args);
        cmd
    }

    fn run(&self, args: &[&str]) -> DeviceResult<CommandOutput> {
        let output = run_bounded(&mut self.adb(args), self.command_timeout)?;
        let combined = format!("{}{}", output.stdout, output.stderr);
        if is_disconnect_message(&combined) {
            return Err(DeviceError::Disconnected(combined.trim().to_string()));
        }
        Ok(output)
    }

    /// Switch the device to the ADB Keyboard IME, remembering the current
    /// one for [`AdbDevice::restore_keyboard`]. Requires the ADB Keyboard
    /// app on the device.
    fn ensure_adb_keyboard(&mut self) -> DeviceResult<()> {
        if self.saved_ime.is_some() {
            return Ok(());
        }
        let output = self.run(&["shell", "settings", "get", "secure", "default_input_method"])?;
        let current = format!("{}{}", output.stdout, output.stderr).trim().to_string();
        if !current.contains(ADB_KEYBOARD_IME) {
            self.run(&["shell", "ime", "set", ADB_KEYBOARD_IME])?;
        }
        self.saved_ime = Some(current);
        Ok(())
    }

    /// Restore the IME that was active before the first text entry
    pub fn restore_keyboard(&mut self) -> DeviceResult<()> {
        if let Some(ime) = self.saved_ime.take() {
            if !ime.is_empty() && !ime.contains(ADB_KEYBOARD_IME) {
                self.run(&["shell", "ime", "set", &ime])?;
            }
        }
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> DeviceResult<()> {
        self.ensure_adb_keyboard()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        self.run(&[
            "shell", "am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded,
        ])?;
        Ok(())
    }

    fn dispatch(&mut self, action: &Action) -> DeviceResult<()> {
        match action {
            Action::Tap { x, y } => {
                self.run(&["shell", "input", "tap", &x.to_string(), &y.to_string()])?;
            }
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                self.run(&[
                    "shell",
                    "input",
                    "swipe",
                    &x1.to_string(),
                    &y1.to_string(),
                    &x2.to_string(),
                    &y2.to_string(),
                    &duration_ms.to_string(),
                ])?;
            }
            Action::TypeText { text } => self.type_text(text)?,
            Action::KeyEvent { key } => {
                let keycode = key_to_keycode(key);
                self.run(&["shell", "input", "keyevent", &keycode])?;
            }
            Action::Wait { duration_ms } => {
                // Local pause; the device is not touched
                std::thread::sleep(Duration::from_millis(*duration_ms));
            }
            Action::Done { .. } | Action::Fail { .. } => {
                return Err(DeviceError::Unknown(
                    "terminal action passed to execute".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Black fallback image used when the device refuses a capture
    fn fallback_screenshot(is_sensitive: bool) -> DeviceResult<Screenshot> {
        let img = image::RgbImage::new(FALLBACK_WIDTH, FALLBACK_HEIGHT);
        let mut png = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageFormat::Png,
        )
        .map_err(|e| DeviceError::Unknown(format!("Failed to encode fallback PNG: {}", e)))?;
        let mut shot = Screenshot::new(png, FALLBACK_WIDTH, FALLBACK_HEIGHT);
        shot.is_sensitive = is_sensitive;
        Ok(shot)
    }
}

impl DeviceController for AdbDevice {
    fn capture_screen(&mut self) -> DeviceResult<Screenshot> {
        let output = self.run(&["shell", "screencap", "-p", REMOTE_CAPTURE_PATH])?;
        let combined = format!("{}{}", output.stdout, output.stderr);

        // Protected surfaces (payment pages etc.) refuse the capture;
        // substitute a black frame rather than killing the run
        if combined.contains("Status: -1") || combined.contains("Failed") {
            return Self::fallback_screenshot(true);
        }

        let local = std::env::temp_dir().join(format!(
            "phone_pilot_{}_{}.png",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        ));
        let local_str = local.to_string_lossy().to_string();
        self.run(&["pull", REMOTE_CAPTURE_PATH, &local_str])?;
        let _ = self.run(&["shell", "rm", "-f", REMOTE_CAPTURE_PATH]);

        if !local.exists() {
            return Self::fallback_screenshot(false);
        }

        let png_data = std::fs::read(&local)?;
        let _ = std::fs::remove_file(&local);

        let img = image::load_from_memory(&png_data)
            .map_err(|e| DeviceError::Unknown(format!("Failed to decode capture: {}", e)))?;

        Ok(Screenshot::new(png_data, img.width(), img.height()))
    }

    fn execute(&mut self, action: &Action) -> ExecResult {
        match self.dispatch(action) {
            Ok(()) => ExecResult::ok(),
            Err(DeviceError::Disconnected(msg)) => ExecResult::disconnected(msg),
            Err(e) => ExecResult::failed(e.to_string()),
        }
    }

    fn controller_type(&self) -> &str {
        "adb"
    }

    fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or("default")
    }
}

/// Captured stdout/stderr of a finished adb invocation
#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
}

/// Run a command to completion within a deadline, killing it on overrun
fn run_bounded(cmd: &mut Command, timeout: Duration) -> DeviceResult<CommandOutput> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| DeviceError::Unknown(format!("Failed to spawn adb: {}", e)))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DeviceError::Timeout(timeout));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(DeviceError::Unknown(e.to_string())),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| DeviceError::Unknown(e.to_string()))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Messages adb emits when the transport to the device is gone
fn is_disconnect_message(text: &str) -> bool {
    text.contains("device offline")
        || text.contains("device not found")
        || text.contains("no devices/emulators found")
}

/// Map a key name to an Android keycode, passing raw keycodes through
fn key_to_keycode(key: &str) -> String {
    match key.to_lowercase().as_str() {
        "home" => "KEYCODE_HOME".to_string(),
        "back" => "KEYCODE_BACK".to_string(),
        "enter" => "KEYCODE_ENTER".to_string(),
        "delete" | "del" => "KEYCODE_DEL".to_string(),
        "tab" => "KEYCODE_TAB".to_string(),
        "space" => "KEYCODE_SPACE".to_string(),
        "menu" => "KEYCODE_MENU".to_string(),
        "power" => "KEYCODE_POWER".to_string(),
        "volume_up" => "KEYCODE_VOLUME_UP".to_string(),
        "volume_down" => "KEYCODE_VOLUME_DOWN".to_string(),
        other if other.starts_with("keycode_") => other.to_uppercase(),
        other => other.to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_output() {
        let stdout = "List of devices attached\nemulator-5554\tdevice\nABC123\tdevice\n";
        assert_eq!(
            parse_devices_output(stdout),
            vec!["emulator-5554".to_string(), "ABC123".to_string()]
        );
    }

    #[test]
    fn test_parse_devices_skips_offline_and_unauthorized() {
        let stdout =
            "List of devices attached\nemulator-5554\toffline\nXYZ789\tunauthorized\nOK1\tdevice\n";
        assert_eq!(parse_devices_output(stdout), vec!["OK1".to_string()]);
    }

    #[test]
    fn test_parse_devices_empty() {
        assert!(parse_devices_output("List of devices attached\n").is_empty());
    }

    #[test]
    fn test_key_to_keycode() {
        assert_eq!(key_to_keycode("back"), "KEYCODE_BACK");
        assert_eq!(key_to_keycode("Home"), "KEYCODE_HOME");
        assert_eq!(key_to_keycode("KEYCODE_CAMERA"), "KEYCODE_CAMERA");
        assert_eq!(key_to_keycode("keycode_camera"), "KEYCODE_CAMERA");
    }

    #[test]
    fn test_is_disconnect_message() {
        assert!(is_disconnect_message("error: device offline"));
        assert!(is_disconnect_message("error: device not found"));
        assert!(!is_disconnect_message("Status: 0"));
    }

    #[test]
    fn test_run_bounded_times_out() {
        let err = run_bounded(
            Command::new("sleep").arg("5"),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[test]
    fn test_run_bounded_captures_output() {
        let out = run_bounded(
            Command::new("echo").arg("hello"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_fallback_screenshot_dimensions() {
        let shot = AdbDevice::fallback_screenshot(true).unwrap();
        assert_eq!(shot.width, FALLBACK_WIDTH);
        assert_eq!(shot.height, FALLBACK_HEIGHT);
        assert!(shot.is_sensitive);
        // PNG magic bytes
        assert_eq!(&shot.png_data[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }
}

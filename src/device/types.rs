// Core types shared by the device controllers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a connected device as reported by `adb devices`
pub type DeviceId = String;

/// A captured device screen
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// PNG-encoded image data
    pub png_data: Vec<u8>,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// True when the device refused the capture (payment pages and other
    /// protected surfaces) and a black fallback image was substituted
    pub is_sensitive: bool,

    /// Timestamp when the capture was taken
    pub timestamp: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(png_data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            png_data,
            width,
            height,
            is_sensitive: false,
            timestamp: Utc::now(),
        }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while talking to a device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The device dropped off the transport (unplugged, adb offline)
    Disconnected(String),
    /// A device command exceeded its deadline
    Timeout(Duration),
    /// Anything else the transport reported
    Unknown(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Disconnected(msg) => write!(f, "Device disconnected: {}", msg),
            DeviceError::Timeout(d) => write!(f, "Device command timed out after {:?}", d),
            DeviceError::Unknown(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Unknown(e.to_string())
    }
}

/// Outcome of one executed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Whether the action took effect on the device
    pub success: bool,

    /// Diagnostic message when it did not
    pub message: Option<String>,

    /// True when the failure means the transport itself is gone, as
    /// opposed to an action that merely failed
    pub disconnected: bool,
}

impl ExecResult {
    /// A successful execution
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            disconnected: false,
        }
    }

    /// A failed execution that leaves the device usable
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            disconnected: false,
        }
    }

    /// A failure caused by the device dropping off the transport
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            disconnected: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_result_constructors() {
        assert!(ExecResult::ok().success);
        let failed = ExecResult::failed("input rejected");
        assert!(!failed.success);
        assert!(!failed.disconnected);
        assert!(ExecResult::disconnected("device offline").disconnected);
    }

    #[test]
    fn test_device_error_display() {
        let e = DeviceError::Timeout(Duration::from_secs(5));
        assert!(e.to_string().contains("5s"));
        let e = DeviceError::Disconnected("usb unplugged".to_string());
        assert!(e.to_string().contains("usb unplugged"));
    }
}

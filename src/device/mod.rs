//! Device control abstraction for screen capture and input injection.
//!
//! This module provides a unified interface over different device backends:
//! - ADB-connected Android devices (real hardware or emulators)
//! - MockDevice (testing with a scriptable framebuffer)

pub mod adb;
pub mod mock;
pub mod types;

use std::collections::HashSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::action::Action;

pub use adb::{AdbDevice, list_devices};
pub use mock::MockDevice;
pub use types::{DeviceError, DeviceId, DeviceResult, ExecResult, Screenshot};

/// Trait for device controllers
///
/// Implementations drive a concrete device transport:
/// - `AdbDevice` for Android devices over the adb binary
/// - `MockDevice` for tests with scripted behavior
///
/// Every call must return within a bounded time; a stalled transport is
/// reported as `DeviceError::Timeout`, never waited out. Terminal actions
/// (`Done`/`Fail`) are never passed to `execute`.
pub trait DeviceController: Send {
    /// Capture the current screen contents
    fn capture_screen(&mut self) -> DeviceResult<Screenshot>;

    /// Execute a single non-terminal action. Issued exactly once; any
    /// retry decision belongs to the caller.
    fn execute(&mut self, action: &Action) -> ExecResult;

    /// Get the controller type identifier (e.g., "adb", "mock")
    fn controller_type(&self) -> &str;

    /// Identifier of the device this controller is bound to
    fn device_id(&self) -> &str;
}

static CLAIMED_DEVICES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a device for the duration of one run.
///
/// Released when dropped. A second claim on the same device id fails
/// immediately instead of interleaving two runs on one transport.
#[derive(Debug)]
pub struct DeviceLease {
    id: String,
}

impl DeviceLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut claimed) = CLAIMED_DEVICES.lock() {
            claimed.remove(&self.id);
        }
    }
}

/// Try to claim exclusive use of a device. Returns `None` when another
/// run already holds it.
pub fn claim_device(id: &str) -> Option<DeviceLease> {
    let mut claimed = CLAIMED_DEVICES.lock().ok()?;
    if claimed.contains(id) {
        return None;
    }
    claimed.insert(id.to_string());
    Some(DeviceLease { id: id.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_device_exclusive() {
        let lease = claim_device("test-claim-1").expect("first claim should succeed");
        assert!(claim_device("test-claim-1").is_none());
        drop(lease);
        assert!(claim_device("test-claim-1").is_some());
    }

    #[test]
    fn test_claim_distinct_devices() {
        let _a = claim_device("test-claim-2a").unwrap();
        let _b = claim_device("test-claim-2b").unwrap();
    }
}

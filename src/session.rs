//! Per-run artifact storage.
//!
//! Every run can be given a session: a directory under a global base
//! location that collects the step screenshots, a metadata file, and the
//! recorded history. Sessions are disposable by default and removed on
//! drop; `--keep` or an explicit output directory preserves them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config;
use crate::run::History;

/// Metadata filename written into each session directory
const METADATA_FILE: &str = ".session.json";

/// Filename of the persisted step record
const HISTORY_FILE: &str = "steps.json";

/// Artifact directory for one run
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after the session ends
    pub keep: bool,
}

impl Session {
    /// Create a new session with a unique ID
    pub fn new() -> Self {
        let id = unique_id("run");
        Session {
            dir: base_dir().join(&id),
            id,
            keep: false,
        }
    }

    /// Create a session named after the task it records
    pub fn with_name(name: &str) -> Self {
        let id = unique_id(&slug(name));
        Session {
            dir: base_dir().join(&id),
            id,
            keep: false,
        }
    }

    /// Use a caller-chosen directory. These are kept by default since the
    /// caller asked for them by path.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = match dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => unique_id("run"),
        };
        Session {
            id,
            dir,
            keep: true,
        }
    }

    /// Set whether to keep files after the session ends
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the session directory and write its metadata
    pub fn init(&self, task: &str, device_id: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
            "host": host,
            "task": task,
            "device": device_id,
        });
        fs::write(
            self.dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )
    }

    /// Path for a step's screenshot file
    pub fn step_path(&self, index: usize, action_kind: Option<&str>) -> PathBuf {
        let filename = match action_kind {
            Some(kind) => format!("step_{}_{}.png", index, slug(kind)),
            None => format!("step_{}.png", index),
        };
        self.dir.join(filename)
    }

    /// Persist a screenshot for a step, returning its path
    pub fn save_screenshot(&self, index: usize, png_data: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.step_path(index, None);
        fs::write(&path, png_data)?;
        Ok(path)
    }

    /// Persist the recorded history
    pub fn save_history(&self, history: &History) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(
            self.dir.join(HISTORY_FILE),
            serde_json::to_string_pretty(history)?,
        )
    }

    /// Screenshots recorded in this session, sorted by filename
    pub fn list_screenshots(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut shots: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
            .collect();
        shots.sort();
        Ok(shots)
    }

    /// Remove the session directory, unless it is marked kept
    pub fn cleanup(&self) -> io::Result<()> {
        if !self.keep && self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn base_dir() -> PathBuf {
    PathBuf::from(&config::get().session.base_dir)
}

/// Build a unique session id from a prefix, a timestamp, and the pid
fn unique_id(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}

/// Reduce a task string to something safe in a filename. Task strings
/// can be long; ids stay readable at 40 characters.
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(40)
        .collect()
}

/// Remove sessions older than `max_age`, returning how many were removed
pub fn cleanup_old_sessions(max_age: std::time::Duration) -> io::Result<usize> {
    let base = base_dir();
    if !base.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(&base)? {
        let path = entry?.path();
        if path.is_dir() && dir_age(&path).is_some_and(|age| age > max_age) {
            if fs::remove_dir_all(&path).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn dir_age(path: &Path) -> Option<std::time::Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// All session directories under the base location, sorted
pub fn list_sessions() -> io::Result<Vec<PathBuf>> {
    let base = base_dir();
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut sessions: Vec<PathBuf> = fs::read_dir(&base)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    sessions.sort();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::new();
        assert!(session.id.starts_with("run_"));
        assert!(!session.keep);
    }

    #[test]
    fn test_session_named_after_task() {
        let session = Session::with_name("open settings");
        assert!(session.id.starts_with("open_settings_"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("open settings"), "open_settings");
        assert_eq!(slug("a/b\\c"), "a_b_c");
        assert_eq!(slug(&"x".repeat(100)).len(), 40);
    }

    #[test]
    fn test_step_path() {
        let session = Session::new();
        assert!(session.step_path(0, None).ends_with("step_0.png"));
        assert!(session.step_path(3, Some("tap")).ends_with("step_3_tap.png"));
    }

    #[test]
    fn test_user_directory_is_kept_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("artifacts");
        let session = Session::in_dir(&dir);
        assert!(session.keep);
        assert_eq!(session.id, "artifacts");
    }

    #[test]
    fn test_session_save_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::in_dir(tmp.path().join("run_test")).keep(false);
        let path = session.save_screenshot(0, b"\x89PNG\r\n").unwrap();
        assert!(path.exists());

        session.save_history(&History::new()).unwrap();
        assert!(session.dir.join(HISTORY_FILE).exists());

        session.cleanup().unwrap();
        assert!(!session.dir.exists());
    }

    #[test]
    fn test_list_screenshots_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::in_dir(tmp.path().join("run_shots"));
        session.save_screenshot(1, b"b").unwrap();
        session.save_screenshot(0, b"a").unwrap();
        session.save_history(&History::new()).unwrap();

        let shots = session.list_screenshots().unwrap();
        assert_eq!(shots.len(), 2);
        assert!(shots[0].ends_with("step_0.png"));
    }
}

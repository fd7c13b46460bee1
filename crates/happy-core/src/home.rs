//! Canonical home directory resolution for happy-control
//!
//! Every crate in the workspace resolves its on-disk locations (settings,
//! daemon state file) through [`get_happy_home`] so tests and custom
//! deployments can redirect everything with a single environment variable.
//!
//! # Precedence
//!
//! 1. `HAPPY_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` joined with `.happy`
//!
//! # Testing
//!
//! Integration tests MUST use `HAPPY_HOME` to isolate state:
//!
//! ```ignore
//! let temp_dir = tempfile::TempDir::new().unwrap();
//! unsafe { std::env::set_var("HAPPY_HOME", temp_dir.path()) };
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;

/// File name of the persisted daemon state inside the happy home directory.
pub const DAEMON_STATE_FILE: &str = "daemon.state.json";

/// File name of the settings file inside the happy home directory.
pub const SETTINGS_FILE: &str = "settings.toml";

/// Get the happy home directory.
///
/// # Errors
///
/// Returns an error if `HAPPY_HOME` is not set and the platform home directory
/// cannot be determined.
pub fn get_happy_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HAPPY_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".happy"))
        .context("Could not determine home directory")
}

/// Path of the daemon state file under `home`.
pub fn daemon_state_path(home: &std::path::Path) -> PathBuf {
    home.join(DAEMON_STATE_FILE)
}

/// Path of the settings file under `home`.
pub fn settings_path(home: &std::path::Path) -> PathBuf {
    home.join(SETTINGS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_happy_home_set() {
        let original = env::var("HAPPY_HOME").ok();
        unsafe { env::set_var("HAPPY_HOME", "/custom/happy") };

        let home = get_happy_home().unwrap();
        assert_eq!(home, PathBuf::from("/custom/happy"));

        unsafe {
            match original {
                Some(v) => env::set_var("HAPPY_HOME", v),
                None => env::remove_var("HAPPY_HOME"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_happy_home_blank_falls_back() {
        let original = env::var("HAPPY_HOME").ok();
        unsafe { env::set_var("HAPPY_HOME", "   ") };

        let home = get_happy_home().unwrap();
        assert!(home.ends_with(".happy"));

        unsafe {
            match original {
                Some(v) => env::set_var("HAPPY_HOME", v),
                None => env::remove_var("HAPPY_HOME"),
            }
        }
    }

    #[test]
    fn test_well_known_paths() {
        let home = PathBuf::from("/tmp/h");
        assert_eq!(daemon_state_path(&home), PathBuf::from("/tmp/h/daemon.state.json"));
        assert_eq!(settings_path(&home), PathBuf::from("/tmp/h/settings.toml"));
    }
}

//! Settings resolution.
//!
//! Priority (highest to lowest):
//!
//! 1. CLI flags (applied by the caller after [`resolve_settings`] returns)
//! 2. Environment variables (`HAPPY_*`)
//! 3. `$HAPPY_HOME/settings.toml`
//! 4. Compiled-in defaults

use super::types::Settings;
use crate::home::settings_path;
use anyhow::Context;
use std::path::Path;
use tracing::{debug, info, warn};

/// Fully resolved settings plus the machine id guaranteed to be present.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub settings: Settings,
    pub machine_id: String,
}

/// Load settings from `home`, apply env overrides and make sure a machine id
/// exists.
///
/// A freshly generated machine id is written back to the settings file so
/// subsequent invocations agree on it. A malformed settings file is reported
/// and replaced by defaults rather than aborting.
///
/// # Errors
///
/// Returns an error only if the settings file exists but cannot be read, or
/// the generated machine id cannot be persisted.
pub fn resolve_settings(home: &Path) -> anyhow::Result<ResolvedSettings> {
    let path = settings_path(home);

    let mut settings = match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str::<Settings>(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed settings file; using defaults");
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file; using defaults");
            Settings::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let machine_id = match settings.machine_id.clone().filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            settings.machine_id = Some(id.clone());
            persist_settings(home, &settings)?;
            info!(machine_id = %id, "generated new machine id");
            id
        }
    };

    apply_env_overrides(&mut settings);

    Ok(ResolvedSettings {
        settings,
        machine_id,
    })
}

/// Write `settings` to `$HAPPY_HOME/settings.toml`, creating the directory.
pub fn persist_settings(home: &Path, settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(home)
        .with_context(|| format!("Failed to create {}", home.display()))?;
    let path = settings_path(home);
    let body = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))
}

/// Apply `HAPPY_*` environment overrides. Empty values are treated as unset.
fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("HAPPY_AGENT_BIN") {
        if !v.is_empty() {
            settings.daemon.agent_bin = v;
        }
    }
    if let Ok(v) = std::env::var("HAPPY_SHUTDOWN_GRACE_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            settings.daemon.shutdown_grace_ms = ms;
        }
    }
    if let Ok(v) = std::env::var("HAPPY_HEARTBEAT_INTERVAL_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            settings.daemon.heartbeat_interval_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("HAPPY_PERMISSION_TIMEOUT_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            settings.session.permission_timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        unsafe {
            std::env::remove_var("HAPPY_AGENT_BIN");
            std::env::remove_var("HAPPY_SHUTDOWN_GRACE_MS");
            std::env::remove_var("HAPPY_HEARTBEAT_INTERVAL_SECS");
            std::env::remove_var("HAPPY_PERMISSION_TIMEOUT_SECS");
        }
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults_and_machine_id() {
        clear_env();
        let tmp = TempDir::new().unwrap();
        let resolved = resolve_settings(tmp.path()).unwrap();

        assert_eq!(resolved.settings.daemon.agent_bin, "happy");
        assert_eq!(resolved.settings.daemon.shutdown_grace_ms, 3000);
        assert_eq!(resolved.settings.session.permission_timeout_secs, 300);
        assert!(!resolved.machine_id.is_empty());

        // Machine id was persisted and is stable across resolutions
        let again = resolve_settings(tmp.path()).unwrap();
        assert_eq!(again.machine_id, resolved.machine_id);
    }

    #[test]
    #[serial]
    fn test_partial_file_keeps_other_defaults() {
        clear_env();
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            settings_path(tmp.path()),
            "machine_id = \"m-1\"\n[daemon]\nagent_bin = \"/opt/agent\"\n",
        )
        .unwrap();

        let resolved = resolve_settings(tmp.path()).unwrap();
        assert_eq!(resolved.machine_id, "m-1");
        assert_eq!(resolved.settings.daemon.agent_bin, "/opt/agent");
        assert_eq!(resolved.settings.daemon.agent_args, vec!["--started-by", "daemon"]);
        assert_eq!(resolved.settings.daemon.heartbeat_interval_secs, 60);
    }

    #[test]
    #[serial]
    fn test_env_overrides_win_over_file() {
        clear_env();
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            settings_path(tmp.path()),
            "machine_id = \"m-2\"\n[daemon]\nshutdown_grace_ms = 10\n",
        )
        .unwrap();

        unsafe {
            std::env::set_var("HAPPY_SHUTDOWN_GRACE_MS", "250");
            std::env::set_var("HAPPY_AGENT_BIN", "");
            std::env::set_var("HAPPY_PERMISSION_TIMEOUT_SECS", "5");
        }
        let resolved = resolve_settings(tmp.path()).unwrap();
        clear_env();

        assert_eq!(resolved.settings.daemon.shutdown_grace_ms, 250);
        assert_eq!(resolved.settings.daemon.agent_bin, "happy");
        assert_eq!(resolved.settings.session.permission_timeout_secs, 5);
    }

    #[test]
    #[serial]
    fn test_malformed_file_falls_back_to_defaults() {
        clear_env();
        let tmp = TempDir::new().unwrap();
        std::fs::write(settings_path(tmp.path()), "this is [not toml").unwrap();

        let resolved = resolve_settings(tmp.path()).unwrap();
        assert_eq!(resolved.settings.daemon.agent_bin, "happy");
    }
}

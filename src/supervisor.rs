//! Helper-service supervision through systemd transient user units.
//!
//! Each helper runs as a `systemd-run --user` unit with
//! `Restart=on-failure`, so a crashed helper is restarted without this
//! process being involved. The opaque unit name returned by `run` is the
//! only handle the caller keeps.

use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        source: std::io::Error,
    },
    #[error("systemd-run refused {binary}: {stderr}")]
    Refused { binary: String, stderr: String },
    #[error("Could not parse unit name from systemd-run output: {0}")]
    UnparseableUnit(String),
}

/// Launch a command as a supervised, auto-restarting transient unit.
pub fn run(argv: &[String]) -> Result<String, SupervisorError> {
    let binary = argv.first().cloned().unwrap_or_default();
    debug!("Launching transient unit: {:?}", argv);

    let output = Command::new("systemd-run")
        .args(["--user", "--collect", "-p", "Restart=on-failure"])
        .args(argv)
        .output()
        .map_err(|source| SupervisorError::Launch {
            binary: binary.clone(),
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(SupervisorError::Refused { binary, stderr });
    }

    parse_unit_name(&stderr).ok_or(SupervisorError::UnparseableUnit(stderr))
}

/// systemd-run announces the unit on stderr as "Running as unit: <name>".
fn parse_unit_name(stderr: &str) -> Option<String> {
    stderr.lines().find_map(|line| {
        let rest = line.split_once(':').filter(|(key, _)| key.trim() == "Running as unit")?;
        let unit = rest.1.trim();
        if unit.is_empty() {
            None
        } else {
            Some(unit.to_string())
        }
    })
}

/// Whether a unit reports active. An empty or unknown handle is simply not
/// active, never an error.
pub fn is_active(unit: &str) -> bool {
    if unit.is_empty() {
        return false;
    }
    match Command::new("systemctl")
        .args(["--user", "is-active", unit])
        .output()
    {
        Ok(output) => {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout).trim() == "active"
        }
        Err(e) => {
            debug!("Could not query unit {}: {}", unit, e);
            false
        }
    }
}

/// Stop a unit, best-effort. Teardown proceeds regardless of the outcome.
pub fn stop(unit: &str) {
    match Command::new("systemctl")
        .args(["--user", "stop", unit])
        .output()
    {
        Ok(output) if !output.status.success() => {
            warn!(
                "Could not stop unit {}: {}",
                unit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(_) => debug!("Stopped unit {}", unit),
        Err(e) => warn!("Could not stop unit {}: {}", unit, e),
    }
}

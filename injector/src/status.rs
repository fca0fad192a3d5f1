//! Status reporting
//!
//! Two sinks, rewritten on every supervisor state change: a one-line
//! human-readable description consumed by the platform's module manager, and
//! a JSON state file for tooling. Both are side effects; failures are logged
//! and never propagate into the event loop.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use log::warn;
use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Serialize)]
pub struct MonitorReport<'a> {
    pub state: &'a str,
    pub stop_reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct AbiReport<'a> {
    pub injected: bool,
    pub daemon_running: bool,
    pub daemon_error: Option<&'a str>,
    pub root_impl: Option<&'a str>,
    pub modules: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub monitor: MonitorReport<'a>,
    pub abi64: AbiReport<'a>,
    pub abi32: AbiReport<'a>,
}

pub struct StatusWriter {
    status_path: PathBuf,
    state_path: PathBuf,
}

impl StatusWriter {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { status_path: config.status_path(), state_path: config.state_path() }
    }

    pub fn write(&self, report: &Report<'_>) {
        if let Err(err) = fs::write(&self.status_path, format!("description={}\n", describe(report)))
        {
            warn!("writing {}: {err}", self.status_path.display());
        }
        match serde_json::to_string_pretty(report) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.state_path, json) {
                    warn!("writing {}: {err}", self.state_path.display());
                }
            }
            Err(err) => warn!("encoding state report: {err}"),
        }
    }
}

fn describe(report: &Report<'_>) -> String {
    let mut line = format!("monitor: {}", report.monitor.state);
    if let Some(reason) = report.monitor.stop_reason {
        let _ = write!(line, " ({reason})");
    }
    for (label, abi) in [("64", &report.abi64), ("32", &report.abi32)] {
        let _ = write!(line, " | zygote{label}: {}", if abi.injected { "injected" } else { "pending" });
        let _ = write!(line, " | daemon{label}: ");
        if abi.daemon_running {
            let _ = write!(line, "running");
            if let Some(root_impl) = abi.root_impl {
                let _ = write!(line, " ({root_impl}, {} modules)", abi.modules.len());
            }
        } else if let Some(error) = abi.daemon_error {
            let _ = write!(line, "dead ({error})");
        } else {
            let _ = write!(line, "not started");
        }
    }
    line
}

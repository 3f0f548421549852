//! Foreground activity probe
//!
//! Answers one question per polling tick: what is this endpoint doing?
//! - Windows: the process owning the foreground window
//! - Elsewhere: the first running process from the tracked application list
//! - Launchers, shells and other idle-listed processes report `"Idle"`

use crate::config::ProbeConfig;
use nexus_protocol::IDLE_LABEL;
use std::collections::HashSet;
use sysinfo::System;
use tracing::debug;

/// Source of the activity label sent with every heartbeat.
pub trait ActivityProbe: Send {
    /// Current label, `"Idle"` when nothing billable runs. Never fails.
    fn sample(&mut self) -> String;
}

pub struct SystemProbe {
    sys: System,
    idle: HashSet<String>,
    tracked: Vec<String>,
}

impl SystemProbe {
    pub fn new(cfg: &ProbeConfig) -> Self {
        Self {
            sys: System::new(),
            idle: cfg.idle_processes.iter().map(|p| process_key(p)).collect(),
            tracked: cfg.tracked_apps.iter().map(|p| process_key(p)).collect(),
        }
    }

    #[cfg(target_os = "windows")]
    fn foreground_process(&mut self) -> Option<String> {
        let pid = windows::foreground_pid()?;
        let pid = sysinfo::Pid::from_u32(pid);
        self.sys.refresh_process(pid);
        self.sys.process(pid).map(|p| p.name().to_string())
    }

    #[cfg(not(target_os = "windows"))]
    fn foreground_process(&mut self) -> Option<String> {
        if self.tracked.is_empty() {
            return None;
        }
        self.sys.refresh_processes();

        let running: Vec<&str> = self.sys.processes().values().map(|p| p.name()).collect();
        self.tracked.iter().find_map(|wanted| {
            running
                .iter()
                .find(|name| process_key(name) == *wanted)
                .map(|name| name.to_string())
        })
    }
}

impl ActivityProbe for SystemProbe {
    fn sample(&mut self) -> String {
        let label = match self.foreground_process() {
            Some(name) => classify(&name, &self.idle),
            None => IDLE_LABEL.to_string(),
        };
        debug!(label = %label, "activity sampled");
        label
    }
}

/// Maps idle-listed and blank names to `"Idle"`, keeps the rest verbatim.
pub fn classify(process_name: &str, idle: &HashSet<String>) -> String {
    let name = process_name.trim();
    if name.is_empty() || idle.contains(&process_key(name)) {
        IDLE_LABEL.to_string()
    } else {
        name.to_string()
    }
}

/// Case-insensitive key without a trailing `.exe`, so one list serves
/// Windows and Unix process names.
fn process_key(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

#[cfg(target_os = "windows")]
mod windows {
    use winapi::um::winuser::{GetForegroundWindow, GetWindowThreadProcessId};

    pub fn foreground_pid() -> Option<u32> {
        // SAFETY: both calls take no borrowed Rust data besides `pid`,
        // which outlives the call.
        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.is_null() {
                return None;
            }
            let mut pid: u32 = 0;
            GetWindowThreadProcessId(hwnd, &mut pid);
            (pid != 0).then_some(pid)
        }
    }
}

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::logging::ProcessLogs;

/// What to do with supervised processes when the launcher itself exits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    #[default]
    Ask,
    Terminate,
    Keep,
}

impl std::fmt::Display for ExitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ExitAction::Ask => "ask",
            ExitAction::Terminate => "terminate",
            ExitAction::Keep => "keep",
        };
        write!(f, "{value}")
    }
}

impl std::str::FromStr for ExitAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(ExitAction::Ask),
            "terminate" | "stop" => Ok(ExitAction::Terminate),
            "keep" => Ok(ExitAction::Keep),
            other => Err(format!("unknown exit action: {other}")),
        }
    }
}

/// The three things needed to (re)create a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub working_directory: PathBuf,
    pub title: String,
}

impl LaunchSpec {
    pub fn new(
        command: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            working_directory: working_directory.into(),
            title: title.into(),
        }
    }
}

/// Record of one process started by this launcher. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub title: String,
    pub command: String,
    pub working_directory: PathBuf,
    pub started_at: SystemTime,
    pub logs: Option<ProcessLogs>,
}

impl ProcessHandle {
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            command: self.command.clone(),
            working_directory: self.working_directory.clone(),
            title: self.title.clone(),
        }
    }

    pub fn target_label(&self) -> String {
        format!("'{}' (PID {})", self.title, self.pid)
    }

    pub fn tracked_for(&self) -> Duration {
        self.started_at.elapsed().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub uptime_secs: f64,
}

/// Ordered key/value snapshot rendered by the details screen.
#[derive(Debug, Clone, Default)]
pub struct ProcessDetails {
    pub pid: u32,
    pub fields: Vec<(String, String)>,
}

impl ProcessDetails {
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.fields.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopAllReport {
    pub stopped: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::{ExitAction, LaunchSpec, ProcessDetails};

    #[test]
    fn exit_action_parses_case_insensitively() {
        assert_eq!("ASK".parse::<ExitAction>(), Ok(ExitAction::Ask));
        assert_eq!(" keep ".parse::<ExitAction>(), Ok(ExitAction::Keep));
        assert_eq!("terminate".parse::<ExitAction>(), Ok(ExitAction::Terminate));
        assert!("maybe".parse::<ExitAction>().is_err());
    }

    #[test]
    fn exit_action_display_round_trips_through_from_str() {
        for action in [ExitAction::Ask, ExitAction::Terminate, ExitAction::Keep] {
            assert_eq!(action.to_string().parse::<ExitAction>(), Ok(action));
        }
    }

    #[test]
    fn details_lookup_returns_first_matching_field() {
        let mut details = ProcessDetails {
            pid: 7,
            ..ProcessDetails::default()
        };
        details.push("Name", "python");
        details.push("Status", "Run");

        assert_eq!(details.get("Status"), Some("Run"));
        assert_eq!(details.get("Missing"), None);
    }

    #[test]
    fn launch_spec_new_accepts_borrowed_values() {
        let spec = LaunchSpec::new("python bot.py", "/srv/bot", "core");
        assert_eq!(spec.command, "python bot.py");
        assert_eq!(spec.working_directory.to_str(), Some("/srv/bot"));
        assert_eq!(spec.title, "core");
    }
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::LauncherError;
use crate::process::{LaunchSpec, ProcessHandle};
use crate::registry::{validate_command, ProcessRegistry};

#[derive(Debug, Deserialize)]
struct PlanFile {
    name: Option<String>,
    #[serde(default)]
    components: Vec<ComponentEntry>,
}

#[derive(Debug, Deserialize)]
struct ComponentEntry {
    name: String,
    title: Option<String>,
    command: String,
    cwd: Option<PathBuf>,
    enabled: Option<bool>,
    required: Option<bool>,
}

/// Ordered list of components to start for one bot deployment.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub name: String,
    pub path: PathBuf,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub title: String,
    pub command: String,
    pub cwd: PathBuf,
    pub enabled: bool,
    pub required: bool,
}

impl Component {
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new(&self.command, &self.cwd, &self.title)
    }
}

#[derive(Debug, Default)]
pub struct LaunchReport {
    pub started: Vec<ProcessHandle>,
    pub failures: Vec<(String, String)>,
    pub skipped: Vec<String>,
    pub aborted: bool,
}

impl LaunchReport {
    pub fn is_success(&self) -> bool {
        !self.aborted && self.failures.is_empty()
    }
}

impl LaunchPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let payload = fs::read_to_string(path)
            .with_context(|| format!("failed to read launch plan at {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let plan = Self::parse(&payload, &base_dir)
            .with_context(|| format!("failed to load launch plan {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            ..plan
        })
    }

    /// Parses plan TOML; relative and missing `cwd` values resolve against `base_dir`.
    pub fn parse(payload: &str, base_dir: &Path) -> Result<Self> {
        let parsed: PlanFile = toml::from_str(payload).context("failed to parse launch plan")?;

        let mut seen = HashSet::new();
        let mut components = Vec::with_capacity(parsed.components.len());
        for entry in parsed.components {
            let name = entry.name.trim().to_string();
            if name.is_empty() {
                return Err(invalid("component name cannot be empty".to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(invalid(format!("duplicate component name: {name}")));
            }

            let title = entry.title.unwrap_or_else(|| name.clone());
            if title.trim().is_empty() {
                return Err(invalid(format!("component {name} has an empty title")));
            }
            validate_command(&entry.command)
                .map_err(|err| invalid(format!("component {name}: {err}")))?;

            let cwd = match entry.cwd {
                Some(cwd) if cwd.is_absolute() => cwd,
                Some(cwd) => base_dir.join(cwd),
                None => base_dir.to_path_buf(),
            };

            components.push(Component {
                name,
                title,
                command: entry.command,
                cwd,
                enabled: entry.enabled.unwrap_or(true),
                required: entry.required.unwrap_or(false),
            });
        }

        Ok(Self {
            name: parsed.name.unwrap_or_else(|| "launch plan".to_string()),
            path: base_dir.join("launch.toml"),
            components,
        })
    }

    pub fn enabled_components(&self) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|component| component.enabled)
            .collect()
    }

    /// Components to start, in plan order. An empty selection means every
    /// enabled component; named components are started even when disabled.
    pub fn select(&self, names: &[String]) -> Result<Vec<&Component>> {
        if names.is_empty() {
            return Ok(self.enabled_components());
        }
        for name in names {
            if !self.components.iter().any(|component| &component.name == name) {
                return Err(invalid(format!("unknown component: {name}")));
            }
        }
        Ok(self
            .components
            .iter()
            .filter(|component| names.contains(&component.name))
            .collect())
    }
}

fn invalid(message: String) -> anyhow::Error {
    LauncherError::InvalidPlan(message).into()
}

/// Starts the selected components in order.
///
/// A failing optional component is reported and skipped; a failing required
/// one aborts the remaining launches.
pub fn launch(
    registry: &mut ProcessRegistry,
    plan: &LaunchPlan,
    selection: &[String],
) -> Result<LaunchReport> {
    let components = plan.select(selection)?;
    info!(
        "launching {} component(s) from plan '{}'",
        components.len(),
        plan.name
    );

    let mut report = LaunchReport::default();
    let mut remaining = components.into_iter();
    while let Some(component) = remaining.next() {
        match registry.start(component.launch_spec()) {
            Ok(handle) => report.started.push(handle),
            Err(err) => {
                report.failures.push((component.name.clone(), err.to_string()));
                if component.required {
                    error!("required component {} failed: {err}", component.name);
                    report.aborted = true;
                    report
                        .skipped
                        .extend(remaining.by_ref().map(|component| component.name.clone()));
                    break;
                }
                warn!("component {} failed to start: {err}", component.name);
            }
        }
    }

    Ok(report)
}

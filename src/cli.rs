use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::process::ExitAction;

const BUILD_VERSION: &str = env!("MAI_LAUNCHER_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Monitor Commands
  stop <PID>       stop a component and its children
  restart <PID>    stop, wait, start the same command again
  details <PID>    full process information
  stopall          stop every component started by this launcher
  quit | q         leave the monitor

Examples
  mai-launcher launch
  mai-launcher launch --only core --only adapter
  mai-launcher launch --on-exit keep
  mai-launcher plan --plan ./launch.toml
";

#[derive(Debug, Parser)]
#[command(
    name = "mai-launcher",
    version = BUILD_VERSION,
    about = "Launcher and status monitor for MaiBot components",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the launch plan and open the status monitor.
    Launch {
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Start only the named component (repeatable).
        #[arg(long = "only")]
        only: Vec<String>,
        /// Override what happens to running components when the launcher exits.
        #[arg(long = "on-exit", value_enum)]
        on_exit: Option<ExitActionArg>,
    },
    /// Print the components of a launch plan.
    Plan {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Print effective settings and paths.
    Settings,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ExitActionArg {
    Ask,
    Terminate,
    Keep,
}

impl From<ExitActionArg> for ExitAction {
    fn from(value: ExitActionArg) -> Self {
        match value {
            ExitActionArg::Ask => ExitAction::Ask,
            ExitActionArg::Terminate => ExitAction::Terminate,
            ExitActionArg::Keep => ExitAction::Keep,
        }
    }
}

mod cli;
mod command;
mod config;
mod errors;
mod launch_plan;
mod logging;
mod metrics;
mod monitor;
mod platform;
mod process;
mod registry;
mod ui;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::launch_plan::{launch, LaunchPlan, LaunchReport};
use crate::logging::{init_tracing, prune_launcher_logs};
use crate::metrics::MetricsSampler;
use crate::process::ExitAction;
use crate::registry::ProcessRegistry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Launch {
            plan,
            only,
            on_exit,
        } => run_launch(&config, plan, &only, on_exit.map(ExitAction::from)).await,
        Commands::Plan { plan } => {
            report_load_warnings(&config);
            print_plan(&plan.unwrap_or_else(|| config.default_plan_path.clone()))
        }
        Commands::Settings => {
            report_load_warnings(&config);
            print_settings(&config)
        }
    }
}

async fn run_launch(
    config: &AppConfig,
    plan_path: Option<PathBuf>,
    only: &[String],
    on_exit: Option<ExitAction>,
) -> Result<()> {
    let log_path = init_tracing(&config.log_dir)?;
    info!(
        "mai-launcher {} starting, base dir {}",
        env!("MAI_LAUNCHER_BUILD_VERSION"),
        config.base_dir.display()
    );
    for warning in &config.load_warnings {
        warn!("{warning}");
    }
    match prune_launcher_logs(&config.log_dir, config.settings.logging.log_rotation_days) {
        Ok(0) => {}
        Ok(removed) => info!("removed {removed} expired launcher log file(s)"),
        Err(err) => warn!("failed to prune launcher logs: {err:#}"),
    }

    let plan_path = plan_path.unwrap_or_else(|| config.default_plan_path.clone());
    let plan = LaunchPlan::load(&plan_path)?;
    let mut registry = ProcessRegistry::new(config.registry_options());

    let report = launch(&mut registry, &plan, only)?;
    print_launch_report(&report);
    if registry.is_empty() {
        if report.is_success() {
            println!("Nothing to launch in {}.", plan_path.display());
            return Ok(());
        }
        anyhow::bail!("no component was started; see {}", log_path.display());
    }

    info!("{} component(s) running", registry.len());
    let exit_action = on_exit.unwrap_or(config.settings.on_exit.process_action);
    let mut sampler = MetricsSampler::new();
    let intervals = config.monitor_intervals();

    loop {
        if let Err(err) = monitor::run(&mut registry, &mut sampler, intervals).await {
            error!("status monitor failed: {err:#}");
            eprintln!("{}", ui::failure(&format!("status monitor failed: {err:#}")));
        }

        let running = registry.list_active().len();
        if running == 0 {
            break;
        }

        let choice = match exit_action {
            ExitAction::Terminate => ExitChoice::Terminate,
            ExitAction::Keep => ExitChoice::Keep,
            ExitAction::Ask => prompt_exit_choice(running)?,
        };
        match choice {
            ExitChoice::Terminate => {
                let stopped = registry.stop_all().await;
                println!(
                    "{} {} stopped, {} failed",
                    ui::label("Components:"),
                    stopped.stopped,
                    stopped.failed
                );
                break;
            }
            ExitChoice::Keep => {
                info!("leaving {running} component(s) running on exit");
                println!(
                    "{}",
                    ui::warning(&format!("Leaving {running} component(s) running."))
                );
                break;
            }
            ExitChoice::Cancel => continue,
        }
    }

    info!("mai-launcher exiting");
    println!("{} {}", ui::label("Launcher log:"), log_path.display());
    Ok(())
}

fn report_load_warnings(config: &AppConfig) {
    for warning in &config.load_warnings {
        eprintln!("{}", ui::warning(warning));
    }
}

fn print_launch_report(report: &LaunchReport) {
    for handle in &report.started {
        println!(
            "{} {}",
            ui::success("started"),
            handle.target_label()
        );
    }
    for (name, reason) in &report.failures {
        println!("{} {name}: {reason}", ui::failure("failed"));
    }
    if report.aborted && !report.skipped.is_empty() {
        println!(
            "{} required component failed, not started: {}",
            ui::warning("aborted"),
            report.skipped.join(", ")
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitChoice {
    Keep,
    Terminate,
    Cancel,
}

fn parse_exit_choice(input: &str) -> Option<ExitChoice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "k" | "keep" => Some(ExitChoice::Keep),
        "t" | "terminate" => Some(ExitChoice::Terminate),
        "c" | "cancel" => Some(ExitChoice::Cancel),
        _ => None,
    }
}

fn prompt_exit_choice(running: usize) -> Result<ExitChoice> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!(
            "{} component(s) still running. [K]eep running, [T]erminate, [C]ancel and return to the monitor: ",
            running
        );
        stdout.flush().context("failed flushing prompt")?;

        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context("failed reading exit choice")?;
        if read == 0 {
            return Ok(ExitChoice::Keep);
        }
        match parse_exit_choice(&line) {
            Some(choice) => return Ok(choice),
            None => println!("{}", ui::warning("Please answer K, T or C.")),
        }
    }
}

fn print_plan(path: &Path) -> Result<()> {
    let plan = LaunchPlan::load(path)?;
    println!("{} {}", ui::label("Plan:"), plan.name);
    println!("{} {}", ui::label("File:"), plan.path.display());

    if plan.components.is_empty() {
        println!("No components in plan.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = plan
        .components
        .iter()
        .map(|component| {
            vec![
                component.name.clone(),
                component.title.clone(),
                yes_no(component.enabled),
                yes_no(component.required),
                component.cwd.display().to_string(),
                component.command.clone(),
            ]
        })
        .collect();
    println!(
        "{}",
        ui::render_table(
            &["NAME", "TITLE", "ENABLED", "REQUIRED", "CWD", "COMMAND"],
            &rows
        )
    );
    Ok(())
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

fn print_settings(config: &AppConfig) -> Result<()> {
    println!("{} {}", ui::label("Base dir:     "), config.base_dir.display());
    println!("{} {}", ui::label("Settings file:"), config.settings_path.display());
    println!("{} {}", ui::label("Default plan: "), config.default_plan_path.display());
    println!("{} {}", ui::label("Log dir:      "), config.log_dir.display());
    println!(
        "{} {}",
        ui::label("On exit:      "),
        ui::exit_action_value(config.settings.on_exit.process_action)
    );
    println!();
    let rendered =
        toml::to_string_pretty(&config.settings).context("failed to render settings")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_exit_choice, yes_no, ExitChoice};

    #[test]
    fn exit_choice_accepts_letters_and_words() {
        assert_eq!(parse_exit_choice("k\n"), Some(ExitChoice::Keep));
        assert_eq!(parse_exit_choice(" T "), Some(ExitChoice::Terminate));
        assert_eq!(parse_exit_choice("cancel"), Some(ExitChoice::Cancel));
        assert_eq!(parse_exit_choice("x"), None);
        assert_eq!(parse_exit_choice(""), None);
    }

    #[test]
    fn yes_no_renders_flags() {
        assert_eq!(yes_no(true), "yes");
        assert_eq!(yes_no(false), "no");
    }
}

use std::cmp::min;
use std::io::{stdout, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use tracing::{debug, info};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::command::{complete, hint, parse, ParsedCommand};
use crate::errors::LauncherError;
use crate::metrics::MetricsSampler;
use crate::process::ProcessDetails;
use crate::registry::{ProcessRegistry, StopOutcome};

const LAUNCHER_TITLE: &str = "mai-launcher (this process)";
const MIN_WIDTH: usize = 60;
const MIN_HEIGHT: usize = 20;
const FIXED_LINES: usize = 16;

/// Timers of the monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorIntervals {
    pub data_refresh: Duration,
    pub render: Duration,
    pub idle_sleep: Duration,
}

impl Default for MonitorIntervals {
    fn default() -> Self {
        Self {
            data_refresh: Duration::from_secs(2),
            render: Duration::from_millis(500),
            idle_sleep: Duration::from_millis(20),
        }
    }
}

/// Runs the interactive status monitor until the user types `quit`.
///
/// Supervised processes are left untouched on return; the caller decides what
/// happens to them.
pub async fn run(
    registry: &mut ProcessRegistry,
    sampler: &mut MetricsSampler,
    intervals: MonitorIntervals,
) -> Result<()> {
    let _guard = TerminalGuard::enter()?;
    info!("status monitor opened");

    let own_pid = std::process::id();
    let mut state = MonitorState::new();
    let mut rows = Vec::<DisplayRow>::new();
    let mut next_refresh_at = Instant::now();
    let mut next_render_at = Instant::now();
    let mut needs_full_clear = true;

    loop {
        let mut dirty = false;

        while event::poll(Duration::ZERO).context("failed polling terminal input")? {
            match event::read().context("failed reading terminal input")? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    let known = known_pids(own_pid, registry);
                    match state.input.apply(key, &known) {
                        InputAction::Ignored => {}
                        InputAction::Edited => dirty = true,
                        InputAction::Submit(line) => {
                            dirty = true;
                            match dispatch(parse(&line), registry, sampler, &mut state, own_pid)
                                .await
                            {
                                LoopFlow::Continue => {}
                                LoopFlow::ShowDetails(details) => {
                                    show_details(&details)?;
                                    needs_full_clear = true;
                                }
                                LoopFlow::Quit => {
                                    info!("status monitor closed");
                                    return Ok(());
                                }
                            }
                            next_refresh_at = Instant::now();
                        }
                    }
                }
                Event::Resize(_, _) => {
                    needs_full_clear = true;
                    dirty = true;
                }
                _ => {}
            }
        }

        if Instant::now() >= next_refresh_at {
            rows = refresh_rows(registry, sampler, own_pid);
            next_refresh_at = Instant::now() + intervals.data_refresh;
            dirty = true;
        }

        if dirty || Instant::now() >= next_render_at {
            let caret_on = (state.opened.elapsed().as_millis() / 500) % 2 == 0;
            let known = known_pids(own_pid, registry);
            draw_frame(&rows, &state, &known, intervals, caret_on, needs_full_clear)?;
            needs_full_clear = false;
            next_render_at = Instant::now() + intervals.render;
        }

        state.prune_flash();
        tokio::time::sleep(intervals.idle_sleep).await;
    }
}

#[derive(Debug)]
enum LoopFlow {
    Continue,
    ShowDetails(ProcessDetails),
    Quit,
}

async fn dispatch(
    command: ParsedCommand,
    registry: &mut ProcessRegistry,
    sampler: &mut MetricsSampler,
    state: &mut MonitorState,
    own_pid: u32,
) -> LoopFlow {
    debug!("monitor command: {command:?}");
    match command {
        ParsedCommand::Empty => {}
        ParsedCommand::Quit => return LoopFlow::Quit,
        ParsedCommand::Error(message) => state.set_error(message),
        ParsedCommand::Stop(pid) => {
            let label = registry
                .get(pid)
                .map(|handle| handle.target_label())
                .unwrap_or_else(|| format!("PID {pid}"));
            match registry.stop(pid).await {
                Ok(StopOutcome::Terminated) => state.set_info(format!("stopped {label}")),
                Ok(StopOutcome::AlreadyExited) => {
                    state.set_info(format!("{label} had already exited"))
                }
                Err(err) => state.set_error(err.to_string()),
            }
            sampler.forget(pid);
        }
        ParsedCommand::Restart(pid) => {
            sampler.forget(pid);
            match registry.restart(pid).await {
                Ok(handle) => {
                    // First reading primes CPU accounting for the new PID.
                    let _ = sampler.sample(handle.pid);
                    state.set_info(format!(
                        "restarted '{}': PID {pid} -> {}",
                        handle.title, handle.pid
                    ));
                }
                Err(err) => state.set_error(err.to_string()),
            }
        }
        ParsedCommand::StopAll => {
            let report = registry.stop_all().await;
            sampler.retain(&[own_pid]);
            if report.failed == 0 {
                state.set_info(format!("stopped {} process(es)", report.stopped));
            } else {
                state.set_error(format!(
                    "stopped {} process(es), {} could not be stopped",
                    report.stopped, report.failed
                ));
            }
        }
        ParsedCommand::Details(pid) => {
            let handle = registry.get(pid).cloned();
            if handle.is_none() && pid != own_pid {
                state.set_error(LauncherError::NotTracked(pid).to_string());
                return LoopFlow::Continue;
            }
            match sampler.details(pid, handle.as_ref()) {
                Some(details) => return LoopFlow::ShowDetails(details),
                None => state.set_error(format!("PID {pid} no longer exists")),
            }
        }
    }
    LoopFlow::Continue
}

fn known_pids(own_pid: u32, registry: &ProcessRegistry) -> Vec<u32> {
    let mut pids = registry.tracked_pids();
    pids.push(own_pid);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[derive(Debug, Clone, PartialEq)]
struct DisplayRow {
    pid: u32,
    title: String,
    cpu_percent: f32,
    memory_mb: f64,
    uptime_secs: f64,
    is_launcher: bool,
}

/// One data refresh: prune exited handles, sample everything in one pass and
/// drop metrics state for PIDs that are no longer listed.
fn refresh_rows(
    registry: &mut ProcessRegistry,
    sampler: &mut MetricsSampler,
    own_pid: u32,
) -> Vec<DisplayRow> {
    let handles = registry.list_active();
    let mut pids = Vec::with_capacity(handles.len() + 1);
    pids.push(own_pid);
    pids.extend(handles.iter().map(|handle| handle.pid));

    let samples = sampler.sample_many(&pids);
    sampler.retain(&pids);

    samples
        .into_iter()
        .filter_map(|(pid, sample)| {
            let sample = sample?;
            let title = if pid == own_pid {
                LAUNCHER_TITLE.to_string()
            } else {
                handles
                    .iter()
                    .find(|handle| handle.pid == pid)
                    .map(|handle| handle.title.clone())?
            };
            Some(DisplayRow {
                pid,
                title,
                cpu_percent: sample.cpu_percent,
                memory_mb: sample.memory_mb,
                uptime_secs: sample.uptime_secs,
                is_launcher: pid == own_pid,
            })
        })
        .collect()
}

#[derive(Debug)]
struct MonitorState {
    input: InputLine,
    flash: Option<FlashMessage>,
    opened: Instant,
}

#[derive(Debug)]
struct FlashMessage {
    text: String,
    level: FlashLevel,
    at: Instant,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FlashLevel {
    Info,
    Error,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            input: InputLine::default(),
            flash: None,
            opened: Instant::now(),
        }
    }

    fn set_info(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.flash = Some(FlashMessage {
            text,
            level: FlashLevel::Info,
            at: Instant::now(),
        });
    }

    fn set_error(&mut self, text: impl Into<String>) {
        self.flash = Some(FlashMessage {
            text: text.into(),
            level: FlashLevel::Error,
            at: Instant::now(),
        });
    }

    fn prune_flash(&mut self) {
        let should_drop = self
            .flash
            .as_ref()
            .map(|message| message.at.elapsed() > Duration::from_secs(4))
            .unwrap_or(false);
        if should_drop {
            self.flash = None;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum InputAction {
    Ignored,
    Edited,
    Submit(String),
}

/// Text typed at the monitor prompt.
#[derive(Debug, Default)]
struct InputLine {
    buffer: String,
}

impl InputLine {
    fn apply(&mut self, key: KeyEvent, known: &[u32]) -> InputAction {
        match key.code {
            KeyCode::Enter => InputAction::Submit(std::mem::take(&mut self.buffer)),
            KeyCode::Tab => match complete(&self.buffer, known) {
                Some(completed) => {
                    self.buffer = completed;
                    InputAction::Edited
                }
                None => InputAction::Ignored,
            },
            KeyCode::Backspace => {
                if self.buffer.pop().is_some() {
                    InputAction::Edited
                } else {
                    InputAction::Ignored
                }
            }
            KeyCode::Char(ch)
                if !ch.is_control()
                    && !key
                        .modifiers
                        .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
            {
                self.buffer.push(ch);
                InputAction::Edited
            }
            _ => InputAction::Ignored,
        }
    }
}

struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("failed enabling raw mode")?;
        let mut out = stdout();
        if let Err(err) = execute!(out, EnterAlternateScreen, cursor::Hide) {
            let _ = disable_raw_mode();
            return Err(err).context("failed entering alternate screen");
        }
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut out = stdout();
        let _ = execute!(out, cursor::Show, LeaveAlternateScreen);
    }
}

fn draw_frame(
    rows: &[DisplayRow],
    state: &MonitorState,
    known: &[u32],
    intervals: MonitorIntervals,
    caret_on: bool,
    clear_all: bool,
) -> Result<()> {
    let (width, height) = terminal::size().context("failed reading terminal size")?;
    let clock = chrono::Local::now().format("%H:%M:%S").to_string();
    let lines = compose_frame(
        rows,
        state,
        known,
        intervals,
        caret_on,
        &clock,
        width as usize,
        height as usize,
    );
    flush_lines(&lines, clear_all)
}

fn flush_lines(lines: &[String], clear_all: bool) -> Result<()> {
    let frame = lines.join("\r\n") + "\r\n";

    let mut out = stdout();
    execute!(out, cursor::MoveTo(0, 0)).context("failed moving cursor")?;
    if clear_all {
        execute!(out, Clear(ClearType::All)).context("failed clearing terminal frame")?;
    }
    out.write_all(frame.as_bytes())
        .context("failed writing terminal monitor frame")?;
    execute!(out, Clear(ClearType::FromCursorDown)).context("failed clearing trailing area")?;
    out.flush().context("failed flushing terminal frame")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compose_frame(
    rows: &[DisplayRow],
    state: &MonitorState,
    known: &[u32],
    intervals: MonitorIntervals,
    caret_on: bool,
    clock: &str,
    width: usize,
    height: usize,
) -> Vec<String> {
    if width < MIN_WIDTH || height < MIN_HEIGHT {
        return vec![paint(
            "1;31",
            &format!("Terminal too small for the monitor. Resize to at least {MIN_WIDTH}x{MIN_HEIGHT}."),
        )];
    }

    let mut lines = Vec::with_capacity(height);
    let title = format!(
        " MAI LAUNCHER  │  {clock}  │  refresh {:.1}s  │  {} running ",
        intervals.data_refresh.as_secs_f64(),
        rows.iter().filter(|row| !row.is_launcher).count()
    );
    lines.push(paint("1;36", &border('╔', '╗', width)));
    lines.push(paint("1;36", &boxed(&title, width)));
    lines.push(paint("1;36", &border('╠', '╣', width)));

    lines.push(boxed(&paint("1;37", " Commands"), width));
    for (usage, description) in HELP {
        let entry = format!("   {}  {description}", paint("1;33", &format!("{usage:<15}")));
        lines.push(boxed(&entry, width));
    }
    lines.push(paint("1;36", &border('╠', '╣', width)));

    let visible_rows = height.saturating_sub(FIXED_LINES).max(1);
    compose_table(&mut lines, rows, visible_rows, width);

    lines.push(paint("1;36", &border('╠', '╣', width)));
    match state.flash.as_ref() {
        Some(message) => {
            let code = match message.level {
                FlashLevel::Info => "1;34",
                FlashLevel::Error => "1;31",
            };
            let text = format!(" {}", message.text);
            lines.push(boxed(&paint(code, &text), width));
        }
        None => lines.push(boxed(" ", width)),
    }
    lines.push(boxed(
        &input_line(&state.input.buffer, known, caret_on),
        width,
    ));
    lines.push(paint("1;36", &border('╚', '╝', width)));
    lines
}

const HELP: [(&str, &str); 5] = [
    ("stop <PID>", "stop a process and everything it started"),
    ("restart <PID>", "stop, wait, then start the same command again"),
    ("details <PID>", "show full process information"),
    ("stopall", "stop every process started by this launcher"),
    ("quit | q", "leave the monitor"),
];

const COLUMNS: [(&str, usize); 5] = [
    ("PID", 8),
    ("TITLE", 28),
    ("CPU%", 7),
    ("MEM(MB)", 9),
    ("UPTIME(s)", 10),
];

fn compose_table(lines: &mut Vec<String>, rows: &[DisplayRow], visible_rows: usize, width: usize) {
    let title_width = width
        .saturating_sub(2)
        .saturating_sub(COLUMNS.iter().map(|(_, col)| *col + 3).sum::<usize>() - COLUMNS[1].1)
        .clamp(12, 48);

    let header: Vec<String> = COLUMNS
        .iter()
        .map(|(name, col)| {
            let col = if *name == "TITLE" { title_width } else { *col };
            format!("{name:<col$}")
        })
        .collect();
    let header = format!(" {}", header.join(" │ "));
    let rule_width = header.chars().count().saturating_sub(1);
    lines.push(boxed(&paint("1;36", &header), width));
    lines.push(boxed(
        &format!(" {}", paint("2;34", &"─".repeat(rule_width))),
        width,
    ));

    let overflow = rows.len() > visible_rows;
    let shown = if overflow {
        visible_rows.saturating_sub(1)
    } else {
        min(rows.len(), visible_rows)
    };

    for row in rows.iter().take(shown) {
        let cells = [
            format!("{:>w$}", row.pid, w = COLUMNS[0].1),
            pad_columns(&ellipsize(&row.title, title_width), title_width),
            format!("{:>w$.1}", row.cpu_percent, w = COLUMNS[2].1),
            format!("{:>w$.1}", row.memory_mb, w = COLUMNS[3].1),
            format!("{:>w$.0}", row.uptime_secs, w = COLUMNS[4].1),
        ];
        let line = format!(" {}", cells.join(" │ "));
        let line = if row.is_launcher {
            paint("2;37", &line)
        } else {
            line
        };
        lines.push(boxed(&line, width));
    }

    if overflow {
        let more = rows.len() - shown;
        lines.push(boxed(
            &paint("2;37", &format!(" … {more} more not shown, enlarge the terminal")),
            width,
        ));
    } else {
        for _ in shown..visible_rows {
            lines.push(boxed(" ", width));
        }
    }
}

fn input_line(buffer: &str, known: &[u32], caret_on: bool) -> String {
    let caret = if caret_on { "▌" } else { " " };
    let suggestion = hint(buffer, known)
        .map(|suffix| paint("2;3", &suffix))
        .unwrap_or_default();
    format!(" {} {buffer}{caret}{suggestion}", paint("1;32", ">"))
}

/// Full-screen key/value view; returns after one key press.
fn show_details(details: &ProcessDetails) -> Result<()> {
    let (width, _) = terminal::size().context("failed reading terminal size")?;
    let lines = compose_details(details, width as usize);
    flush_lines(&lines, true)?;

    loop {
        if let Event::Key(key) = event::read().context("failed reading terminal input")? {
            if key.kind == KeyEventKind::Press {
                return Ok(());
            }
        }
    }
}

fn compose_details(details: &ProcessDetails, width: usize) -> Vec<String> {
    let width = width.max(MIN_WIDTH);
    let key_width = details
        .fields
        .iter()
        .map(|(key, _)| key.chars().count())
        .max()
        .unwrap_or(0);
    let value_width = width.saturating_sub(key_width + 7);

    let mut lines = Vec::with_capacity(details.fields.len() + 6);
    lines.push(paint("1;36", &border('╔', '╗', width)));
    lines.push(paint(
        "1;36",
        &boxed(
            &format!(
                " PROCESS DETAILS  │  PID {}  │  {} ",
                details.pid,
                details.get("Name").unwrap_or("-")
            ),
            width,
        ),
    ));
    lines.push(paint("1;36", &border('╠', '╣', width)));
    for (key, value) in &details.fields {
        let line = format!(
            " {}  {}",
            paint("1;37", &format!("{key:<key_width$}")),
            ellipsize(value, value_width)
        );
        lines.push(boxed(&line, width));
    }
    lines.push(paint("1;36", &border('╠', '╣', width)));
    lines.push(boxed(
        &paint("2;37", " press any key to return to the monitor"),
        width,
    ));
    lines.push(paint("1;36", &border('╚', '╝', width)));
    lines
}

/// Horizontal `═` border spanning `width` columns between two corner glyphs.
fn border(left: char, right: char, width: usize) -> String {
    let mut line = String::with_capacity(width * 3);
    line.push(left);
    line.extend(std::iter::repeat('═').take(width.saturating_sub(2)));
    line.push(right);
    line
}

/// Places `content` between the side borders, clipped or space-filled to fit.
fn boxed(content: &str, width: usize) -> String {
    let inner = width.saturating_sub(2);
    let (fitted, used) = clip_styled(content, inner);
    format!("║{fitted}{}║", " ".repeat(inner - used))
}

/// Keeps at most `max` terminal columns, passing escape sequences through.
/// Wide (CJK) characters take two columns. Returns the clipped text and the
/// columns it occupies.
fn clip_styled(value: &str, max: usize) -> (String, usize) {
    let mut out = String::with_capacity(value.len());
    let mut used = 0;
    let mut styled = false;
    let mut clipped = false;
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            styled = true;
            out.push(ch);
            for next in chars.by_ref() {
                out.push(next);
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        let columns = ch.width().unwrap_or(0);
        if used + columns > max {
            clipped = true;
            break;
        }
        out.push(ch);
        used += columns;
    }
    if styled && clipped {
        out.push_str("\x1b[0m");
    }
    (out, used)
}

/// Shortens plain text to `max` columns, ending with `…` when cut.
fn ellipsize(value: &str, max: usize) -> String {
    if value.width() <= max {
        return value.to_string();
    }
    let budget = max.saturating_sub(1);
    let mut out = String::new();
    let mut used = 0;
    for ch in value.chars() {
        let columns = ch.width().unwrap_or(0);
        if used + columns > budget {
            break;
        }
        out.push(ch);
        used += columns;
    }
    out.push('…');
    out
}

/// Left-aligns `value` in `width` columns.
fn pad_columns(value: &str, width: usize) -> String {
    let fill = width.saturating_sub(value.width());
    format!("{value}{}", " ".repeat(fill))
}

fn paint(code: &str, value: &str) -> String {
    format!("\x1b[{code}m{value}\x1b[0m")
}

//! Terminal styling helpers shared by the plan/settings printouts and the exit prompt.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use unicode_width::UnicodeWidthStr;

use crate::process::ExitAction;

fn colors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if std::env::var("TERM")
            .map(|term| term.eq_ignore_ascii_case("dumb"))
            .unwrap_or(false)
        {
            return false;
        }

        io::stdout().is_terminal()
    })
}

fn paint(value: &str, code: &str) -> String {
    if colors_enabled() {
        format!("\x1b[{code}m{value}\x1b[0m")
    } else {
        value.to_string()
    }
}

/// Styles a general UI label.
pub fn label(value: &str) -> String {
    paint(value, "1;36")
}

pub fn warning(value: &str) -> String {
    paint(value, "1;33")
}

pub fn failure(value: &str) -> String {
    paint(value, "1;31")
}

pub fn success(value: &str) -> String {
    paint(value, "1;32")
}

pub fn exit_action_value(action: ExitAction) -> String {
    let value = action.to_string();
    match action {
        ExitAction::Ask => paint(&value, "1;33"),
        ExitAction::Terminate => paint(&value, "1;31"),
        ExitAction::Keep => paint(&value, "1;32"),
    }
}

/// Applies colouring to a pre-padded yes/no table cell.
fn style_flag_cell(padded: &str, raw: &str) -> String {
    match raw {
        "yes" => paint(padded, "1;32"),
        "no" => paint(padded, "2;37"),
        _ => padded.to_string(),
    }
}

/// Renders a bordered table. Cells holding `yes`/`no` are coloured after
/// padding so the borders stay aligned.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            rows.iter()
                .filter_map(|row| row.get(idx))
                .map(|cell| cell.width())
                .fold(header.width(), usize::max)
        })
        .collect();

    let rule: String = widths
        .iter()
        .map(|width| format!("{}+", "-".repeat(width + 2)))
        .collect();
    let rule = paint(&format!("+{rule}"), "2;34");

    let header_cells: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(header, width)| paint(&pad_columns(header, *width), "1;36"))
        .collect();

    let mut lines = vec![rule.clone(), table_row(&header_cells), rule.clone()];
    for row in rows {
        let cells: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(idx, width)| {
                let cell = row.get(idx).map(String::as_str).unwrap_or("");
                style_flag_cell(&pad_columns(cell, *width), cell)
            })
            .collect();
        lines.push(table_row(&cells));
    }
    lines.push(rule);
    lines.join("\n")
}

fn pad_columns(value: &str, width: usize) -> String {
    format!("{value}{}", " ".repeat(width.saturating_sub(value.width())))
}

fn table_row(cells: &[String]) -> String {
    format!("| {} |", cells.join(" | "))
}

/// Formats an uptime in seconds, as reported by the metrics sampler.
pub fn format_uptime(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "-".to_string();
    }
    format_duration_compact(secs as u64)
}

pub fn format_duration_compact(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let mins = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use unicode_width::UnicodeWidthStr;

    use super::{format_duration_compact, format_uptime, render_table};

    #[test]
    fn duration_uses_two_most_significant_units() {
        assert_eq!(format_duration_compact(42), "42s");
        assert_eq!(format_duration_compact(125), "2m 5s");
        assert_eq!(format_duration_compact(3 * 3_600 + 61), "3h 1m");
        assert_eq!(format_duration_compact(2 * 86_400 + 7_200), "2d 2h");
    }

    #[test]
    fn uptime_is_dash_for_nonsense_values() {
        assert_eq!(format_uptime(-1.0), "-");
        assert_eq!(format_uptime(f64::NAN), "-");
        assert_eq!(format_uptime(59.9), "59s");
    }

    #[test]
    fn table_rows_line_up_with_headers() {
        std::env::set_var("NO_COLOR", "1");
        let table = render_table(
            &["NAME", "ENABLED"],
            &[
                vec!["core".to_string(), "yes".to_string()],
                vec!["adapter-long".to_string(), "no".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines
            .iter()
            .all(|line| line.chars().count() == lines[0].chars().count()));
        assert!(lines[3].contains("core"));
    }

    #[test]
    fn table_pads_wide_titles_by_display_width() {
        std::env::set_var("NO_COLOR", "1");
        let table = render_table(
            &["NAME", "TITLE"],
            &[
                vec!["core".to_string(), "麦麦本体".to_string()],
                vec!["adapter".to_string(), "adapter".to_string()],
            ],
        );
        let widths: Vec<usize> = table.lines().map(UnicodeWidthStr::width).collect();
        assert!(widths.iter().all(|width| *width == widths[0]), "{table}");
    }
}

//! Parsing and completion for the monitor's command line.
//!
//! Grammar, with a case-insensitive command word:
//!
//! ```text
//! stop <pid>
//! restart <pid>
//! details <pid>
//! stopall
//! quit | q
//! ```

/// Command words in completion priority order.
pub const COMMANDS: [&str; 6] = ["stop", "restart", "details", "stopall", "quit", "q"];

const PID_COMMANDS: [&str; 3] = ["stop", "restart", "details"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Empty,
    Stop(u32),
    Restart(u32),
    Details(u32),
    StopAll,
    Quit,
    Error(String),
}

pub fn parse(line: &str) -> ParsedCommand {
    let mut tokens = line.split_whitespace();
    let Some(raw_word) = tokens.next() else {
        return ParsedCommand::Empty;
    };
    let word = raw_word.to_lowercase();

    match word.as_str() {
        "stopall" => ParsedCommand::StopAll,
        "quit" | "q" => ParsedCommand::Quit,
        "stop" | "restart" | "details" => {
            let Some(pid) = tokens.next().and_then(|arg| arg.parse::<u32>().ok()) else {
                return ParsedCommand::Error(format!("usage: {word} <PID>"));
            };
            match word.as_str() {
                "stop" => ParsedCommand::Stop(pid),
                "restart" => ParsedCommand::Restart(pid),
                _ => ParsedCommand::Details(pid),
            }
        }
        _ => ParsedCommand::Error(format!("unknown command: {raw_word}")),
    }
}

/// First command word that extends `partial` without being equal to it.
pub fn suggest_command(partial: &str) -> Option<&'static str> {
    if partial.is_empty() {
        return None;
    }
    let partial = partial.to_lowercase();
    COMMANDS
        .iter()
        .copied()
        .find(|command| command.starts_with(&partial) && *command != partial)
}

/// Lowest known PID whose decimal form starts with `partial`.
pub fn suggest_pid(partial: &str, known: &[u32]) -> Option<String> {
    if !partial.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let mut sorted = known.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|pid| pid.to_string())
        .find(|pid| pid.starts_with(partial))
}

/// Applies Tab completion to `buffer`. Returns the new buffer, or `None` when
/// there is nothing to complete.
///
/// A lone command word completes to the first command that starts with it,
/// an exact match included, so `stop` becomes `stop ` and `stopa` becomes
/// `stopall`. A trailing space is added only for words that take a PID.
pub fn complete(buffer: &str, known: &[u32]) -> Option<String> {
    let completed = match buffer.split_once(' ') {
        None => {
            if buffer.is_empty() {
                return None;
            }
            let partial = buffer.to_lowercase();
            let command = COMMANDS
                .iter()
                .copied()
                .find(|command| command.starts_with(&partial))?;
            if PID_COMMANDS.contains(&command) {
                format!("{command} ")
            } else {
                command.to_string()
            }
        }
        Some((word, arg)) => {
            let word = word.to_lowercase();
            if !PID_COMMANDS.contains(&word.as_str()) {
                return None;
            }
            let pid = suggest_pid(arg, known)?;
            format!("{word} {pid}")
        }
    };

    (completed != buffer).then_some(completed)
}

/// The completion suffix shown after the typed text, if any.
pub fn hint(buffer: &str, known: &[u32]) -> Option<String> {
    let (typed, suggestion) = match buffer.split_once(' ') {
        None => (buffer, suggest_command(buffer)?.to_string()),
        Some((word, arg)) => {
            if !PID_COMMANDS.contains(&word.to_lowercase().as_str()) || arg.is_empty() {
                return None;
            }
            (arg, suggest_pid(arg, known)?)
        }
    };

    let suffix: String = suggestion.chars().skip(typed.chars().count()).collect();
    (!suffix.is_empty()).then_some(suffix)
}

#[cfg(test)]
mod tests {
    use super::{complete, hint, parse, suggest_command, suggest_pid, ParsedCommand};

    #[test]
    fn parse_accepts_every_command_form() {
        assert_eq!(parse("stop 1234"), ParsedCommand::Stop(1234));
        assert_eq!(parse("restart 42"), ParsedCommand::Restart(42));
        assert_eq!(parse("details 7"), ParsedCommand::Details(7));
        assert_eq!(parse("stopall"), ParsedCommand::StopAll);
        assert_eq!(parse("quit"), ParsedCommand::Quit);
        assert_eq!(parse("q"), ParsedCommand::Quit);
    }

    #[test]
    fn parse_is_case_insensitive_and_trims_whitespace() {
        assert_eq!(parse("  STOP   99  "), ParsedCommand::Stop(99));
        assert_eq!(parse("Q"), ParsedCommand::Quit);
        assert_eq!(parse("StopAll"), ParsedCommand::StopAll);
    }

    #[test]
    fn parse_reports_usage_for_missing_or_bad_pid() {
        assert_eq!(
            parse("stop"),
            ParsedCommand::Error("usage: stop <PID>".to_string())
        );
        assert_eq!(
            parse("stop abc"),
            ParsedCommand::Error("usage: stop <PID>".to_string())
        );
        assert_eq!(
            parse("restart -5"),
            ParsedCommand::Error("usage: restart <PID>".to_string())
        );
        assert_eq!(
            parse("details 99999999999"),
            ParsedCommand::Error("usage: details <PID>".to_string())
        );
    }

    #[test]
    fn parse_treats_blank_line_as_no_op() {
        assert_eq!(parse(""), ParsedCommand::Empty);
        assert_eq!(parse("   "), ParsedCommand::Empty);
    }

    #[test]
    fn parse_rejects_unknown_words() {
        assert_eq!(
            parse("bogus"),
            ParsedCommand::Error("unknown command: bogus".to_string())
        );
    }

    #[test]
    fn parse_ignores_extra_tokens() {
        assert_eq!(parse("stop 12 now"), ParsedCommand::Stop(12));
        assert_eq!(parse("quit please"), ParsedCommand::Quit);
    }

    #[test]
    fn suggest_command_skips_exact_matches() {
        assert_eq!(suggest_command("sto"), Some("stop"));
        assert_eq!(suggest_command("stop"), Some("stopall"));
        assert_eq!(suggest_command("re"), Some("restart"));
        assert_eq!(suggest_command("Det"), Some("details"));
        assert_eq!(suggest_command("q"), Some("quit"));
        assert_eq!(suggest_command("stopall"), None);
        assert_eq!(suggest_command("x"), None);
        assert_eq!(suggest_command(""), None);
    }

    #[test]
    fn suggest_pid_uses_ascending_order() {
        let known = [500, 43, 42];
        assert_eq!(suggest_pid("4", &known), Some("42".to_string()));
        assert_eq!(suggest_pid("5", &known), Some("500".to_string()));
        assert_eq!(suggest_pid("", &known), Some("42".to_string()));
        assert_eq!(suggest_pid("6", &known), None);
        assert_eq!(suggest_pid("4a", &known), None);
    }

    #[test]
    fn tab_completes_command_words() {
        assert_eq!(complete("sto", &[]), Some("stop ".to_string()));
        assert_eq!(complete("stop", &[]), Some("stop ".to_string()));
        assert_eq!(complete("stopa", &[]), Some("stopall".to_string()));
        assert_eq!(complete("res", &[]), Some("restart ".to_string()));
        assert_eq!(complete("q", &[]), Some("quit".to_string()));
        assert_eq!(complete("stopall", &[]), None);
        assert_eq!(complete("zzz", &[]), None);
        assert_eq!(complete("", &[]), None);
    }

    #[test]
    fn tab_completes_pid_argument() {
        let known = [42, 43, 500];
        assert_eq!(complete("stop 4", &known), Some("stop 42".to_string()));
        assert_eq!(complete("details ", &known), Some("details 42".to_string()));
        assert_eq!(complete("RESTART 5", &known), Some("restart 500".to_string()));
        assert_eq!(complete("stop 42", &known), None);
        assert_eq!(complete("stopall 4", &known), None);
        assert_eq!(complete("stop 9", &known), None);
    }

    #[test]
    fn hint_shows_remaining_characters() {
        let known = [42, 43, 500];
        assert_eq!(hint("sto", &known), Some("p".to_string()));
        assert_eq!(hint("stop", &known), Some("all".to_string()));
        assert_eq!(hint("stop 4", &known), Some("2".to_string()));
        assert_eq!(hint("stop ", &known), None);
        assert_eq!(hint("stop 42", &known), None);
        assert_eq!(hint("", &known), None);
    }
}

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("PID {0} is not managed by this launcher")]
    NotTracked(u32),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to start '{title}': {source}")]
    Spawn {
        title: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to terminate PID {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
    #[error("invalid launch plan: {0}")]
    InvalidPlan(String),
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::io;

    use super::LauncherError;

    #[test]
    fn spawn_error_keeps_the_os_error_as_source() {
        let err = LauncherError::Spawn {
            title: "NapCat".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "cmd.exe missing"),
        };
        assert_eq!(err.to_string(), "failed to start 'NapCat': cmd.exe missing");
        let source = err.source().expect("io source");
        assert_eq!(source.to_string(), "cmd.exe missing");
    }

    #[test]
    fn not_tracked_names_the_pid() {
        assert_eq!(
            LauncherError::NotTracked(4242).to_string(),
            "PID 4242 is not managed by this launcher"
        );
    }
}

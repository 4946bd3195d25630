//! Tracing subscriber setup for the `stagehand` binary.
//!
//! Console output goes to stderr (JSON with `--log-json`). When the repo's
//! state directory is writable, a daily-rolling plain-text log is also kept in
//! `<repo>/.stagehand/logs/`.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::state_dir;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "STAGEHAND_LOG";

const DEFAULT_FILTER: &str = "stagehand=info";
const LOG_FILE_PREFIX: &str = "stagehand.log";

pub fn logs_dir(repo_path: &Path) -> PathBuf {
    state_dir(repo_path).join("logs")
}

/// Filter from `STAGEHAND_LOG`, falling back to `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed.
pub fn init(repo_path: &Path, json: bool, verbose: bool) -> Option<WorkerGuard> {
    let default = if verbose { "stagehand=debug" } else { DEFAULT_FILTER };

    let mut guard = None;
    let file_layer = match std::fs::create_dir_all(logs_dir(repo_path)) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir(repo_path), LOG_FILE_PREFIX);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter(default)),
            )
        }
        Err(e) => {
            eprintln!("Warning: failed to create logs directory: {}", e);
            None
        }
    };

    let console_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(default))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(default))
            .boxed()
    };

    let result = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init();
    if let Err(e) = result {
        eprintln!("Warning: logging already initialized: {}", e);
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_dir_is_under_state_dir() {
        let dir = logs_dir(Path::new("/repo"));
        assert_eq!(dir, PathBuf::from("/repo/.stagehand/logs"));
    }

    #[test]
    fn test_env_filter_falls_back_to_default() {
        // unset in the test environment
        let filter = env_filter("stagehand=warn");
        assert!(filter.to_string().contains("stagehand"));
    }
}

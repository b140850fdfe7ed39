//! Recorder API for host integrations

use crate::recorder::{ActivityRecorder, ScopeOracle};
use crate::settings::JsonFilePreferences;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

/// Get the version of the activity log library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
///
/// Debug builds log to stderr. Release builds write a daily rolling file
/// under `<log_dir>/logs`, or `./logs` when no directory is given. Calling
/// this again after a subscriber is installed is not an error.
#[allow(unused_variables)]
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let log_dir = log_dir
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "proxy_activity_log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until process exit
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init();
    }

    tracing::info!("Proxy activity log initialized v{}", get_version());
    Ok(())
}

fn resolve_log_level() -> LevelFilter {
    parse_log_level(std::env::var("RUST_LOG").ok().as_deref())
}

fn parse_log_level(value: Option<&str>) -> LevelFilter {
    match value.map(str::to_lowercase).as_deref() {
        Some("trace") => LevelFilter::TRACE,
        Some("debug") => LevelFilter::DEBUG,
        Some("warn") | Some("warning") => LevelFilter::WARN,
        Some("error") => LevelFilter::ERROR,
        Some("off") => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Load preferences from `prefs_file` and start a recorder from them.
pub async fn start_recorder(
    prefs_file: &Path,
    scope: Arc<dyn ScopeOracle>,
) -> anyhow::Result<ActivityRecorder> {
    let prefs = JsonFilePreferences::open(prefs_file)
        .with_context(|| format!("Failed to load preferences from {}", prefs_file.display()))?;
    let recorder = ActivityRecorder::bootstrap(Arc::new(prefs), scope)
        .await
        .context("Failed to start the activity recorder")?;
    Ok(recorder)
}

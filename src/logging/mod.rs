use std::error::Error;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber.
///
/// Logs go to a daily rolling file when `logging.file` is set, otherwise to
/// stderr so stdout only carries results.
///
/// # Arguments
/// * `config` - Logging section of the settings
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false);

    match &config.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "effnet-export.log".to_string());
            std::fs::create_dir_all(directory)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, directory, prefix);
            // Disable ANSI colors for cleaner log files
            builder.with_writer(appender).with_ansi(false).try_init()?;
        }
        None => {
            builder.with_writer(std::io::stderr).try_init()?;
        }
    }

    tracing::debug!("Logging initialized at level {}", config.level);
    Ok(())
}

use crate::{environment::Environment, errors::ContributeError};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;

/// Name of the log file written in the output directory.
pub const LOG_FILE_NAME: &str = "contributor.log";

static LOGGER: OnceCell<WorkerGuard> = OnceCell::new();

///
/// Initialize logger with custom format and verbosity, writing to stdout and
/// to [`LOG_FILE_NAME`] in the output directory.
///
/// Only the first call installs the logger.
///
pub fn initialize_logger(environment: &Environment) -> Result<(), ContributeError> {
    LOGGER.get_or_try_init(|| {
        use tracing_subscriber::{fmt, fmt::format::Format, layer::SubscriberExt, FmtSubscriber};

        let output_directory = environment.output_directory();
        fs_err::create_dir_all(output_directory)?;

        let file_appender = tracing_appender::rolling::never(output_directory, LOG_FILE_NAME);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        let file_output = fmt::Layer::default().with_ansi(false).with_writer(file_writer);

        let console_output = FmtSubscriber::builder()
            .with_max_level(*environment.verbosity())
            .with_target(false)
            .event_format(Format::default())
            .finish();

        tracing::subscriber::set_global_default(console_output.with(file_output))
            .map_err(|e| ContributeError::Crate("tracing", e.to_string()))?;

        // The guard flushes the file writer when dropped, so it lives as long as the process.
        Ok::<_, ContributeError>(guard)
    })?;

    Ok(())
}

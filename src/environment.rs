use crate::errors::ContributeError;

use std::{env, path::PathBuf, str::FromStr, time::Duration};
use url::Url;

pub const COORDINATOR_API_URL: &str = "COORDINATOR_API_URL";
pub const COORDINATOR_TOKEN: &str = "COORDINATOR_TOKEN";
pub const CEREMONY_BUCKET: &str = "CEREMONY_BUCKET";
pub const STREAM_CHUNK_SIZE_IN_MB: &str = "CONFIG_STREAM_CHUNK_SIZE_IN_MB";
pub const PRESIGNED_URL_EXPIRATION_IN_SECONDS: &str = "CONFIG_PRESIGNED_URL_EXPIRATION_IN_SECONDS";
pub const VERIFY_TIMEOUT_SECS: &str = "VERIFY_TIMEOUT_SECS";
pub const UPLOAD_CONCURRENCY: &str = "UPLOAD_CONCURRENCY";
pub const CONTRIBUTOR_OUTPUT_DIR: &str = "CONTRIBUTOR_OUTPUT_DIR";
pub const CONTRIBUTOR_VERBOSITY: &str = "CONTRIBUTOR_VERBOSITY";

const MEGABYTE: u64 = 1024 * 1024;
const DEFAULT_PART_SIZE_IN_MB: u64 = 50;
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

///
/// Runtime settings of the contributor.
///
#[derive(Debug, Clone)]
pub struct Environment {
    coordinator_api_url: Option<Url>,
    coordinator_token: Option<String>,
    bucket: String,
    part_size: u64,
    presigned_url_expiration: Option<u64>,
    verify_timeout: Duration,
    upload_concurrency: usize,
    output_directory: PathBuf,
    verbosity: tracing::Level,
    show_progress: bool,
}

impl Environment {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            coordinator_api_url: None,
            coordinator_token: None,
            bucket: bucket.into(),
            part_size: DEFAULT_PART_SIZE_IN_MB * MEGABYTE,
            presigned_url_expiration: None,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            upload_concurrency: 1,
            output_directory: PathBuf::from("output"),
            verbosity: tracing::Level::INFO,
            show_progress: true,
        }
    }

    ///
    /// Loads the settings from the process environment.
    ///
    /// The part authorization expiration is not required here; its absence
    /// is reported when a contribution starts.
    ///
    pub fn from_env() -> Result<Self, ContributeError> {
        let bucket = read_var::<String>(CEREMONY_BUCKET)?.ok_or(ContributeError::MissingConfiguration(CEREMONY_BUCKET))?;
        let mut environment = Self::new(bucket);

        environment.coordinator_api_url = read_var(COORDINATOR_API_URL)?;
        environment.coordinator_token = read_var(COORDINATOR_TOKEN)?;
        environment.presigned_url_expiration = read_var(PRESIGNED_URL_EXPIRATION_IN_SECONDS)?;

        if let Some(megabytes) = read_var::<u64>(STREAM_CHUNK_SIZE_IN_MB)? {
            environment = environment.with_part_size(megabytes.saturating_mul(MEGABYTE))?;
        }
        if let Some(seconds) = read_var::<u64>(VERIFY_TIMEOUT_SECS)? {
            environment.verify_timeout = Duration::from_secs(seconds);
        }
        if let Some(concurrency) = read_var::<usize>(UPLOAD_CONCURRENCY)? {
            environment = environment.with_upload_concurrency(concurrency)?;
        }
        if let Some(directory) = read_var::<PathBuf>(CONTRIBUTOR_OUTPUT_DIR)? {
            environment.output_directory = directory;
        }
        if let Some(verbosity) = read_var::<tracing::Level>(CONTRIBUTOR_VERBOSITY)? {
            environment.verbosity = verbosity;
        }

        Ok(environment)
    }

    pub fn with_coordinator_api_url(mut self, url: Url) -> Self {
        self.coordinator_api_url = Some(url);
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Result<Self, ContributeError> {
        if part_size == 0 {
            return Err(ContributeError::InvalidConfiguration(
                STREAM_CHUNK_SIZE_IN_MB,
                "the part size must be positive".to_string(),
            ));
        }
        self.part_size = part_size;
        Ok(self)
    }

    pub fn with_presigned_url_expiration(mut self, seconds: u64) -> Self {
        self.presigned_url_expiration = Some(seconds);
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Result<Self, ContributeError> {
        if concurrency == 0 {
            return Err(ContributeError::InvalidConfiguration(
                UPLOAD_CONCURRENCY,
                "at least one part must be in flight".to_string(),
            ));
        }
        self.upload_concurrency = concurrency;
        Ok(self)
    }

    pub fn with_output_directory(mut self, directory: PathBuf) -> Self {
        self.output_directory = directory;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn coordinator_api_url(&self) -> Result<&Url, ContributeError> {
        self.coordinator_api_url
            .as_ref()
            .ok_or(ContributeError::MissingConfiguration(COORDINATOR_API_URL))
    }

    pub fn coordinator_token(&self) -> Option<&str> {
        self.coordinator_token.as_deref()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Size of every multipart part except possibly the last, in bytes.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Lifetime of a part authorization, in seconds.
    pub fn presigned_url_expiration(&self) -> Result<u64, ContributeError> {
        self.presigned_url_expiration
            .ok_or(ContributeError::MissingConfiguration(PRESIGNED_URL_EXPIRATION_IN_SECONDS))
    }

    pub fn verify_timeout(&self) -> Duration {
        self.verify_timeout
    }

    pub fn upload_concurrency(&self) -> usize {
        self.upload_concurrency
    }

    pub fn output_directory(&self) -> &PathBuf {
        &self.output_directory
    }

    pub fn verbosity(&self) -> &tracing::Level {
        &self.verbosity
    }

    pub fn show_progress(&self) -> bool {
        self.show_progress
    }
}

/// Reads and parses an environment variable. Unset and empty variables are `None`.
fn read_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ContributeError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|error| ContributeError::InvalidConfiguration(name, error.to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ContributeError::InvalidConfiguration(
            name,
            "value is not valid unicode".to_string(),
        )),
    }
}

use crate::timeout::RemainingTime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContributeError {
    #[error("{}: {}", _0, _1)]
    Crate(&'static str, String),

    #[error("Missing required configuration parameter {}", _0)]
    MissingConfiguration(&'static str),

    #[error("Invalid configuration parameter {}: {}", _0, _1)]
    InvalidConfiguration(&'static str, String),

    #[error("Invalid participant checkpoint: {}", _0)]
    InvalidCheckpoint(String),

    #[error("Failed to update the participant checkpoint: {}", _0)]
    FailedCheckpointUpdate(String),

    #[error("Request {} sent to {} errored", _0, _1)]
    FailedRequest(String, String),

    #[error("Failed to download {}", _0)]
    FailedDownload(String),

    #[error("Failed to open a multipart upload for {}", _0)]
    FailedTransferOpen(String),

    #[error("Failed to authorize parts of upload {}", _0)]
    FailedPartAuthorization(String),

    #[error("Failed to transmit part {} of upload {}", _0, _1)]
    FailedPartTransmission(u32, String),

    #[error("Part {} of upload {} was already recorded", _0, _1)]
    DuplicatePart(u32, String),

    #[error("Upload {} has {} recorded parts, expected 1..={}", upload_id, recorded, expected)]
    IncompleteUpload {
        upload_id: String,
        recorded: usize,
        expected: u32,
    },

    #[error("Failed to finalize upload {}: {}", _0, _1)]
    FailedTransferFinalize(String, String),

    #[error("Failed to compute the contribution: {}", _0)]
    FailedComputation(String),

    #[error("Transcript {} does not contain a contribution hash", _0)]
    MissingContributionHash(String),

    #[error("The contribution time window has expired, you may retry in {}", remaining)]
    TimeoutExpired {
        remaining: RemainingTime,
        retry_at: Option<u64>,
    },

    #[error("Failed to verify the contribution: {}", _0)]
    FailedVerification(String),

    #[error("Verification did not complete within {} seconds", _0)]
    VerificationTimeout(u64),
}

/// The failure classes a caller reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Transfer,
    Computation,
    DataIntegrity,
    Timeout,
    Verification,
}

impl ErrorCategory {
    /// Process exit code used by the binary for this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::Configuration => 2,
            ErrorCategory::Transfer => 3,
            ErrorCategory::Computation => 4,
            ErrorCategory::DataIntegrity => 5,
            ErrorCategory::Timeout => 6,
            ErrorCategory::Verification => 7,
        }
    }
}

impl ContributeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ContributeError::MissingConfiguration(_) | ContributeError::InvalidConfiguration(..) => {
                ErrorCategory::Configuration
            }
            ContributeError::Crate(..)
            | ContributeError::FailedCheckpointUpdate(_)
            | ContributeError::FailedRequest(..)
            | ContributeError::FailedDownload(_)
            | ContributeError::FailedTransferOpen(_)
            | ContributeError::FailedPartAuthorization(_)
            | ContributeError::FailedPartTransmission(..)
            | ContributeError::FailedTransferFinalize(..) => ErrorCategory::Transfer,
            ContributeError::FailedComputation(_) => ErrorCategory::Computation,
            ContributeError::InvalidCheckpoint(_)
            | ContributeError::DuplicatePart(..)
            | ContributeError::IncompleteUpload { .. }
            | ContributeError::MissingContributionHash(_) => ErrorCategory::DataIntegrity,
            ContributeError::TimeoutExpired { .. } => ErrorCategory::Timeout,
            ContributeError::FailedVerification(_) | ContributeError::VerificationTimeout(_) => {
                ErrorCategory::Verification
            }
        }
    }

    /// Returns `true` if re-invoking the contribution may succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        match self.category() {
            ErrorCategory::Transfer
            | ErrorCategory::Computation
            | ErrorCategory::Timeout
            | ErrorCategory::Verification => true,
            ErrorCategory::Configuration | ErrorCategory::DataIntegrity => false,
        }
    }
}

impl From<reqwest::Error> for ContributeError {
    fn from(error: reqwest::Error) -> Self {
        ContributeError::Crate("reqwest", format!("{:?}", error))
    }
}

impl From<std::io::Error> for ContributeError {
    fn from(error: std::io::Error) -> Self {
        ContributeError::Crate("std::io", format!("{:?}", error))
    }
}

impl From<serde_json::Error> for ContributeError {
    fn from(error: serde_json::Error) -> Self {
        ContributeError::Crate("serde_json", format!("{:?}", error))
    }
}

impl From<url::ParseError> for ContributeError {
    fn from(error: url::ParseError) -> Self {
        ContributeError::Crate("url", format!("{:?}", error))
    }
}

use crate::errors::ContributeError;

use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, time::Duration};

/// The zero-padded index of the first artifact in every circuit.
/// Its width fixes the width of every later index.
pub const FIRST_CONTRIBUTION_INDEX: &str = "00000";

/// The file name suffix of the closing beacon artifact.
pub const FINAL_CONTRIBUTION_SUFFIX: &str = "final";

///
/// The steps of a single contribution attempt, in execution order.
///
/// The derived ordering follows declaration order, which is what the
/// state machine relies on to decide whether a step was already completed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStep {
    NotStarted,
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Completed,
}

impl ContributionStep {
    /// Returns the step that follows `self`. `Completed` is terminal.
    pub fn next(self) -> Self {
        match self {
            ContributionStep::NotStarted => ContributionStep::Downloading,
            ContributionStep::Downloading => ContributionStep::Computing,
            ContributionStep::Computing => ContributionStep::Uploading,
            ContributionStep::Uploading => ContributionStep::Verifying,
            ContributionStep::Verifying => ContributionStep::Completed,
            ContributionStep::Completed => ContributionStep::Completed,
        }
    }
}

impl fmt::Display for ContributionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContributionStep::NotStarted => "not started",
            ContributionStep::Downloading => "downloading",
            ContributionStep::Computing => "computing",
            ContributionStep::Uploading => "uploading",
            ContributionStep::Verifying => "verifying",
            ContributionStep::Completed => "completed",
        };
        write!(f, "{}", name)
    }
}

/// Historical average durations of each step, in milliseconds.
/// Only used to display an estimate to the contributor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AverageTimings {
    pub downloading: u64,
    pub computing: u64,
    pub uploading: u64,
    pub verifying: u64,
}

impl AverageTimings {
    /// Returns the average for `step`, or `None` if nothing was recorded yet.
    pub fn for_step(&self, step: ContributionStep) -> Option<Duration> {
        let millis = match step {
            ContributionStep::Downloading => self.downloading,
            ContributionStep::Computing => self.computing,
            ContributionStep::Uploading => self.uploading,
            ContributionStep::Verifying => self.verifying,
            ContributionStep::NotStarted | ContributionStep::Completed => 0,
        };
        match millis {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

///
/// A circuit of the ceremony awaiting this participant's contribution.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circuit {
    pub id: String,
    pub sequence_position: u64,
    /// Stable name used to build artifact file names and storage keys.
    pub prefix: String,
    /// Number of contributions already accepted. This is the index of the
    /// predecessor artifact.
    pub completed_contributions: u64,
    #[serde(default)]
    pub average_timings: AverageTimings,
    /// Fixed time window granted to a contributor, in milliseconds.
    #[serde(default)]
    pub timeout_window: Option<u64>,
}

///
/// The positional index of an artifact within a circuit, zero-padded to the
/// width of [`FIRST_CONTRIBUTION_INDEX`]. Wider values are never truncated.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContributionIndex {
    value: u64,
    width: usize,
}

impl ContributionIndex {
    pub fn new(value: u64) -> Self {
        Self::with_width(value, FIRST_CONTRIBUTION_INDEX.len())
    }

    pub fn with_width(value: u64, width: usize) -> Self {
        Self { value, width }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Returns the index of the artifact produced from this one.
    pub fn next(&self) -> Self {
        Self::with_width(self.value + 1, self.width)
    }
}

impl fmt::Display for ContributionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.value, width = self.width)
    }
}

/// Identifies the participant whose checkpoint the core reads and writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantKey {
    pub ceremony_id: String,
    pub participant_id: String,
}

impl ParticipantKey {
    pub fn new(ceremony_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            ceremony_id: ceremony_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ceremony_id, self.participant_id)
    }
}

/// A transmitted part of a multipart upload and the token the storage
/// returned for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    #[serde(alias = "PartNumber")]
    pub part_number: u32,
    #[serde(alias = "ETag")]
    pub completion_token: String,
}

impl UploadedPart {
    pub fn new(part_number: u32, completion_token: impl Into<String>) -> Self {
        Self {
            part_number,
            completion_token: completion_token.into(),
        }
    }
}

///
/// The in-flight state of a multipart upload.
///
/// A session only ever grows: parts are appended once and never replaced.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    #[serde(default)]
    pub chunks: Vec<UploadedPart>,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            chunks: vec![],
        }
    }

    /// Returns `true` if a completion token is already recorded for `part_number`.
    pub fn contains(&self, part_number: u32) -> bool {
        self.chunks.iter().any(|part| part.part_number == part_number)
    }

    ///
    /// Records a transmitted part. Recording the same part number twice is
    /// an error, since each part's token must be recorded exactly once.
    ///
    pub fn record(&mut self, part: UploadedPart) -> Result<(), ContributeError> {
        if part.part_number == 0 || self.contains(part.part_number) {
            return Err(ContributeError::DuplicatePart(part.part_number, self.upload_id.clone()));
        }
        self.chunks.push(part);
        Ok(())
    }

    ///
    /// Returns the recorded parts sorted by part number, checking that they
    /// form exactly the contiguous range `1..=number_of_parts`.
    ///
    pub fn completed_parts(&self, number_of_parts: u32) -> Result<Vec<UploadedPart>, ContributeError> {
        let mut parts = self.chunks.clone();
        parts.sort_by_key(|part| part.part_number);

        let contiguous = parts.len() == number_of_parts as usize
            && parts
                .iter()
                .zip(1..=number_of_parts)
                .all(|(part, expected)| part.part_number == expected);
        if !contiguous {
            return Err(ContributeError::IncompleteUpload {
                upload_id: self.upload_id.clone(),
                recorded: parts.len(),
                expected: number_of_parts,
            });
        }

        Ok(parts)
    }

    fn validate(&self) -> Result<(), ContributeError> {
        if self.upload_id.is_empty() {
            return Err(ContributeError::InvalidCheckpoint(
                "upload session has recorded parts but no upload id".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for part in &self.chunks {
            if part.part_number == 0 {
                return Err(ContributeError::InvalidCheckpoint(format!(
                    "upload {} records part number 0",
                    self.upload_id
                )));
            }
            if !seen.insert(part.part_number) {
                return Err(ContributeError::InvalidCheckpoint(format!(
                    "upload {} records part {} twice",
                    self.upload_id, part.part_number
                )));
            }
        }
        Ok(())
    }
}

///
/// The persisted progress of a participant, owned by the checkpoint authority.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCheckpoint {
    pub current_step: ContributionStep,
    #[serde(default, alias = "tempContributionData")]
    pub temp_upload: Option<UploadSession>,
    /// When the current attempt started, in milliseconds since the epoch.
    #[serde(default)]
    pub contribution_started_at: Option<u64>,
}

impl ParticipantCheckpoint {
    pub fn new(current_step: ContributionStep) -> Self {
        Self {
            current_step,
            temp_upload: None,
            contribution_started_at: None,
        }
    }

    ///
    /// Validates the checkpoint read from the authority.
    ///
    /// A session without an upload id and without parts is treated as absent.
    ///
    pub fn validate(mut self) -> Result<Self, ContributeError> {
        if let Some(session) = &self.temp_upload {
            if session.upload_id.is_empty() && session.chunks.is_empty() {
                self.temp_upload = None;
            } else {
                session.validate()?;
            }
        }
        Ok(self)
    }
}

/// The durable record of a computed contribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRecord {
    pub circuit_id: String,
    pub contribution_hash: String,
    pub computation_time: u64,
}

/// Identifies the contribution the verification service should check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub ceremony_id: String,
    pub circuit_id: String,
    pub participant_id: String,
}

/// The verdict returned by the verification service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(alias = "verifyCloudFunctionTime")]
    pub verify_duration_ms: u64,
    #[serde(alias = "fullContributionTime")]
    pub full_duration_ms: u64,
}

/// Local wall-clock duration of each executed step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepTimings {
    pub downloading: Option<Duration>,
    pub computing: Option<Duration>,
    pub uploading: Option<Duration>,
    pub verifying: Option<Duration>,
}

///
/// The result of one `run` of the contribution state machine.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContributionOutcome {
    pub circuit_id: String,
    pub sequence_position: u64,
    /// Suffix of the produced artifact: its index, or `final` for a beacon.
    pub artifact: String,
    /// Present only when this run executed the computing step.
    pub contribution_hash: Option<String>,
    pub timings: StepTimings,
    /// Present only when this run executed the verifying step.
    pub verification: Option<VerificationResult>,
}

impl ContributionOutcome {
    /// Returns `true` if the verification service accepted the contribution.
    pub fn is_valid(&self) -> bool {
        self.verification.as_ref().map(|result| result.valid).unwrap_or(false)
    }
}

//! The remote and local collaborators the contribution flow depends on.

use crate::{
    computer::TranscriptLogger,
    errors::ContributeError,
    objects::{
        ContributionRecord,
        ContributionStep,
        ParticipantCheckpoint,
        ParticipantKey,
        UploadSession,
        UploadedPart,
        VerificationRequest,
        VerificationResult,
    },
};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A time-limited permission to transmit one part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAuthorization {
    pub part_number: u32,
    pub url: String,
}

/// Object storage holding the ceremony artifacts.
#[async_trait]
pub trait ObjectTransfer: Send + Sync {
    /// Opens a multipart upload and returns its opaque id.
    async fn open_transfer(&self, bucket: &str, key: &str) -> Result<String, ContributeError>;

    /// Returns one authorization for each of `part_numbers`.
    async fn authorize_parts(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_numbers: &[u32],
        expiration_secs: u64,
    ) -> Result<Vec<PartAuthorization>, ContributeError>;

    /// Transmits the bytes of one part and returns its completion token.
    async fn transmit_part(
        &self,
        authorization: &PartAuthorization,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ContributeError>;

    /// Combines the transmitted parts into the stored object. `parts` must be
    /// sorted by part number and contiguous from 1.
    async fn finalize_transfer(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ContributeError>;

    /// Downloads the object at `key` into `local_path`, replacing any existing file.
    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), ContributeError>;
}

/// The authority owning each participant's persisted progress.
#[async_trait]
pub trait CheckpointAuthority: Send + Sync {
    async fn get_participant_checkpoint(
        &self,
        participant: &ParticipantKey,
    ) -> Result<ParticipantCheckpoint, ContributeError>;

    async fn set_participant_step(
        &self,
        participant: &ParticipantKey,
        step: ContributionStep,
    ) -> Result<(), ContributeError>;

    async fn set_temp_upload_session(
        &self,
        participant: &ParticipantKey,
        session: &UploadSession,
    ) -> Result<(), ContributeError>;

    /// Appends one completed part to the persisted upload session.
    async fn add_uploaded_part(&self, participant: &ParticipantKey, part: &UploadedPart) -> Result<(), ContributeError>;

    /// Permanently stores the fingerprint and computation time of a contribution.
    async fn store_contribution_record(
        &self,
        participant: &ParticipantKey,
        record: &ContributionRecord,
    ) -> Result<(), ContributeError>;

    /// Returns when a timed out participant may retry, in milliseconds since the epoch.
    async fn next_retry_time(&self, participant: &ParticipantKey) -> Result<Option<u64>, ContributeError>;
}

/// The cryptographic engine transforming a predecessor artifact.
#[async_trait]
pub trait ArtifactComputer: Send + Sync {
    ///
    /// Writes the artifact derived from `predecessor` to `target`.
    ///
    /// Human-readable progress goes to `transcript`, which must include the
    /// contribution hash block.
    ///
    async fn compute(
        &self,
        predecessor: &Path,
        target: &Path,
        contributor: &str,
        randomness: &SecretString,
        transcript: &mut TranscriptLogger,
        is_finalizing: bool,
    ) -> Result<(), ContributeError>;
}

/// The remote service verifying an uploaded contribution.
#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult, ContributeError>;
}

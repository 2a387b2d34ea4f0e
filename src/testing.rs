//! In-memory collaborators recording every call, for tests.

use crate::{
    computer::TranscriptLogger,
    errors::ContributeError,
    interfaces::{ArtifactComputer, CheckpointAuthority, ObjectTransfer, PartAuthorization, VerificationService},
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
use secrecy::{ExposeSecret, SecretString};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

/// The contribution hash printed by [`ScriptedComputer`].
pub const CONTRIBUTION_HASH: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f9\
                                     00112233445566778899aabbccddeeff\
                                     deadbeefcafebabe0123456789abcdef\
                                     feedface0badf00d76543210fedcba98";

const URL_SCHEME: &str = "memory://";

/// A call made to one of the in-memory collaborators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Download(String),
    OpenTransfer(String),
    AuthorizeParts(Vec<u32>),
    TransmitPart(u32),
    FinalizeTransfer(Vec<u32>),
    SetStep(ContributionStep),
    SetTempUpload(String),
    AddUploadedPart(u32),
    StoreRecord(String),
    NextRetryTime,
    Compute { is_finalizing: bool },
    Verify,
}

/// An ordered record of calls, shareable between collaborators.
pub type CallLog = Arc<Mutex<Vec<Call>>>;

fn record(log: &CallLog, call: Call) {
    log.lock().expect("call log lock poisoned").push(call);
}

#[derive(Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: HashMap<u32, (String, Vec<u8>)>,
}

#[derive(Default)]
struct StorageState {
    objects: HashMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    opened: u64,
    failing_part: Option<u32>,
    failing_finalize: bool,
    failing_download: bool,
}

///
/// Object storage holding artifacts in memory, with the ordering rules of a
/// multipart upload: finalization needs parts sorted and contiguous from 1.
///
#[derive(Default)]
pub struct MemoryStorage {
    log: CallLog,
    state: Mutex<StorageState>,
}

impl MemoryStorage {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StorageState> {
        self.state.lock().expect("storage lock poisoned")
    }

    pub fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.state()
            .objects
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().expect("call log lock poisoned").clone()
    }

    pub fn clear_calls(&self) {
        self.log.lock().expect("call log lock poisoned").clear();
    }

    /// Returns the part numbers of every attempted transmission, in order.
    pub fn transmitted_parts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::TransmitPart(part_number) => Some(part_number),
                _ => None,
            })
            .collect()
    }

    pub fn fail_transmission_of(&self, part_number: u32) {
        self.state().failing_part = Some(part_number);
    }

    pub fn fail_finalize(&self) {
        self.state().failing_finalize = true;
    }

    pub fn fail_download(&self) {
        self.state().failing_download = true;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_part = None;
        state.failing_finalize = false;
        state.failing_download = false;
    }
}

#[async_trait]
impl ObjectTransfer for MemoryStorage {
    async fn open_transfer(&self, bucket: &str, key: &str) -> Result<String, ContributeError> {
        record(&self.log, Call::OpenTransfer(key.to_string()));

        let mut state = self.state();
        state.opened += 1;
        let upload_id = format!("upload-{}", state.opened);
        state.uploads.insert(upload_id.clone(), PendingUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            parts: HashMap::new(),
        });
        Ok(upload_id)
    }

    async fn authorize_parts(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_numbers: &[u32],
        _expiration_secs: u64,
    ) -> Result<Vec<PartAuthorization>, ContributeError> {
        record(&self.log, Call::AuthorizeParts(part_numbers.to_vec()));

        let state = self.state();
        match state.uploads.get(upload_id) {
            Some(upload) if upload.bucket == bucket && upload.key == key => Ok(part_numbers
                .iter()
                .map(|part_number| PartAuthorization {
                    part_number: *part_number,
                    url: format!("{}{}/{}", URL_SCHEME, upload_id, part_number),
                })
                .collect()),
            _ => Err(ContributeError::FailedPartAuthorization(upload_id.to_string())),
        }
    }

    async fn transmit_part(
        &self,
        authorization: &PartAuthorization,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, ContributeError> {
        record(&self.log, Call::TransmitPart(authorization.part_number));

        let mut state = self.state();
        let upload_id = authorization
            .url
            .strip_prefix(URL_SCHEME)
            .and_then(|path| path.split('/').next())
            .unwrap_or_default()
            .to_string();
        if state.failing_part == Some(authorization.part_number) {
            return Err(ContributeError::FailedPartTransmission(authorization.part_number, upload_id));
        }

        let token = format!("etag-{}-{}", authorization.part_number, body.len());
        let upload = state
            .uploads
            .get_mut(&upload_id)
            .ok_or_else(|| ContributeError::FailedPartTransmission(authorization.part_number, upload_id.clone()))?;
        upload.parts.insert(authorization.part_number, (token.clone(), body));
        Ok(token)
    }

    async fn finalize_transfer(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ContributeError> {
        record(
            &self.log,
            Call::FinalizeTransfer(parts.iter().map(|part| part.part_number).collect()),
        );

        let rejected = |reason: &str| ContributeError::FailedTransferFinalize(upload_id.to_string(), reason.to_string());

        let mut state = self.state();
        if state.failing_finalize {
            return Err(rejected("injected failure"));
        }
        let upload = state.uploads.get(upload_id).ok_or_else(|| rejected("unknown upload"))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(rejected("wrong destination"));
        }
        if parts.is_empty() {
            return Err(rejected("no parts"));
        }

        let mut bytes = vec![];
        for (expected, part) in (1u32..).zip(parts) {
            if part.part_number != expected {
                return Err(rejected("parts are not sorted and contiguous"));
            }
            match upload.parts.get(&part.part_number) {
                Some((token, body)) if *token == part.completion_token => bytes.extend_from_slice(body),
                _ => return Err(rejected("unknown completion token")),
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), ContributeError> {
        record(&self.log, Call::Download(key.to_string()));

        let bytes = {
            let state = self.state();
            if state.failing_download {
                return Err(ContributeError::FailedDownload(key.to_string()));
            }
            state
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| ContributeError::FailedDownload(key.to_string()))?
        };
        tokio::fs::write(local_path, bytes).await?;
        Ok(())
    }
}

struct CheckpointState {
    checkpoint: ParticipantCheckpoint,
    records: Vec<ContributionRecord>,
    retry_at: Option<u64>,
}

///
/// A checkpoint authority for a single participant. Steps may only move
/// forward, as the real authority enforces.
///
pub struct MemoryCheckpoints {
    log: CallLog,
    state: Mutex<CheckpointState>,
}

impl Default for MemoryCheckpoints {
    fn default() -> Self {
        Self::new(ParticipantCheckpoint::new(ContributionStep::NotStarted))
    }
}

impl MemoryCheckpoints {
    pub fn new(checkpoint: ParticipantCheckpoint) -> Self {
        Self::with_log(checkpoint, CallLog::default())
    }

    pub fn with_log(checkpoint: ParticipantCheckpoint, log: CallLog) -> Self {
        Self {
            log,
            state: Mutex::new(CheckpointState {
                checkpoint,
                records: vec![],
                retry_at: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CheckpointState> {
        self.state.lock().expect("checkpoint lock poisoned")
    }

    pub fn checkpoint(&self) -> ParticipantCheckpoint {
        self.state().checkpoint.clone()
    }

    pub fn records(&self) -> Vec<ContributionRecord> {
        self.state().records.clone()
    }

    pub fn set_retry_time(&self, retry_at: u64) {
        self.state().retry_at = Some(retry_at);
    }
}

#[async_trait]
impl CheckpointAuthority for MemoryCheckpoints {
    async fn get_participant_checkpoint(
        &self,
        _participant: &ParticipantKey,
    ) -> Result<ParticipantCheckpoint, ContributeError> {
        Ok(self.checkpoint())
    }

    async fn set_participant_step(
        &self,
        _participant: &ParticipantKey,
        step: ContributionStep,
    ) -> Result<(), ContributeError> {
        record(&self.log, Call::SetStep(step));

        let mut state = self.state();
        if step < state.checkpoint.current_step {
            return Err(ContributeError::FailedCheckpointUpdate(format!(
                "cannot move from {} back to {}",
                state.checkpoint.current_step, step
            )));
        }
        state.checkpoint.current_step = step;
        Ok(())
    }

    async fn set_temp_upload_session(
        &self,
        _participant: &ParticipantKey,
        session: &UploadSession,
    ) -> Result<(), ContributeError> {
        record(&self.log, Call::SetTempUpload(session.upload_id.clone()));
        self.state().checkpoint.temp_upload = Some(session.clone());
        Ok(())
    }

    async fn add_uploaded_part(&self, _participant: &ParticipantKey, part: &UploadedPart) -> Result<(), ContributeError> {
        record(&self.log, Call::AddUploadedPart(part.part_number));

        let mut state = self.state();
        let session = state
            .checkpoint
            .temp_upload
            .as_mut()
            .ok_or_else(|| ContributeError::FailedCheckpointUpdate("no upload session in progress".to_string()))?;
        session
            .record(part.clone())
            .map_err(|e| ContributeError::FailedCheckpointUpdate(e.to_string()))
    }

    async fn store_contribution_record(
        &self,
        _participant: &ParticipantKey,
        contribution: &ContributionRecord,
    ) -> Result<(), ContributeError> {
        record(&self.log, Call::StoreRecord(contribution.contribution_hash.clone()));
        self.state().records.push(contribution.clone());
        Ok(())
    }

    async fn next_retry_time(&self, _participant: &ParticipantKey) -> Result<Option<u64>, ContributeError> {
        record(&self.log, Call::NextRetryTime);
        Ok(self.state().retry_at)
    }
}

///
/// Derives the new artifact by appending the contributor name and the
/// randomness to the predecessor, and prints a fixed contribution hash.
///
pub struct ScriptedComputer {
    log: CallLog,
    print_hash: bool,
    fail: bool,
}

impl Default for ScriptedComputer {
    fn default() -> Self {
        Self::with_log(CallLog::default())
    }
}

impl ScriptedComputer {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            print_hash: true,
            fail: false,
        }
    }

    /// Omits the contribution hash from the transcript.
    pub fn without_hash(mut self) -> Self {
        self.print_hash = false;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// The artifact this computer derives from `predecessor`.
    pub fn expected_artifact(predecessor: &[u8], contributor: &str, randomness: &str) -> Vec<u8> {
        [predecessor, contributor.as_bytes(), randomness.as_bytes()].concat()
    }
}

#[async_trait]
impl ArtifactComputer for ScriptedComputer {
    async fn compute(
        &self,
        predecessor: &Path,
        target: &Path,
        contributor: &str,
        randomness: &SecretString,
        transcript: &mut TranscriptLogger,
        is_finalizing: bool,
    ) -> Result<(), ContributeError> {
        record(&self.log, Call::Compute { is_finalizing });
        if self.fail {
            return Err(ContributeError::FailedComputation("scripted failure".to_string()));
        }

        let input = tokio::fs::read(predecessor).await?;
        transcript.log(&format!("Contributing as {} to {} bytes", contributor, input.len()))?;
        tokio::fs::write(
            target,
            Self::expected_artifact(&input, contributor, randomness.expose_secret()),
        )
        .await?;

        if self.print_hash {
            transcript.log("Contribution Hash: ")?;
            for line in CONTRIBUTION_HASH.as_bytes().chunks(32) {
                let words: Vec<&str> = line
                    .chunks(8)
                    .map(|word| std::str::from_utf8(word).unwrap_or_default())
                    .collect();
                transcript.log(&format!("\t\t{}", words.join(" ")))?;
            }
        }
        transcript.log("Contribution computed")?;
        Ok(())
    }
}

/// A verification service answering with a fixed verdict.
pub struct FixedVerifier {
    log: CallLog,
    result: VerificationResult,
    delay: Option<Duration>,
    fail: bool,
}

impl FixedVerifier {
    pub fn with_log(valid: bool, log: CallLog) -> Self {
        Self {
            log,
            result: VerificationResult {
                valid,
                verify_duration_ms: 1_200,
                full_duration_ms: 5_400,
            },
            delay: None,
            fail: false,
        }
    }

    /// Answers only after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl VerificationService for FixedVerifier {
    async fn verify(&self, _request: &VerificationRequest) -> Result<VerificationResult, ContributeError> {
        record(&self.log, Call::Verify);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ContributeError::FailedVerification("scripted failure".to_string()));
        }
        Ok(self.result.clone())
    }
}

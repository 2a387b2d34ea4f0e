use crate::{
    cli::commands::contribute::ContributeOptions,
    computer::{ProcessComputer, TranscriptLogger},
    environment::Environment,
    errors::ContributeError,
    interfaces::{ArtifactComputer, CheckpointAuthority, ObjectTransfer, VerificationService},
    logger::initialize_logger,
    objects::{
        Circuit,
        ContributionIndex,
        ContributionOutcome,
        ContributionRecord,
        ContributionStep,
        ParticipantCheckpoint,
        ParticipantKey,
        StepTimings,
        UploadSession,
        VerificationRequest,
        VerificationResult,
        FINAL_CONTRIBUTION_SUFFIX,
    },
    requests::CoordinatorClient,
    status::StatusHandle,
    timeout::{now_millis, remaining, RemainingTime, TimeoutGuard},
    upload::MultipartUpload,
    utils::{
        artifact_file_name,
        artifact_storage_key,
        extract_contribution_hash,
        format_duration,
        remove_file_if_exists,
        transcript_path,
    },
};

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Password};
use rand::{rngs::OsRng, RngCore};
use secrecy::SecretString;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{error, info, warn};

const GENERATED_ENTROPY_BYTES: usize = 32;

///
/// How a run enters the step sequence.
///
/// `Resume` skips every step the checkpoint shows as completed and persists
/// each transition. `Finalize` executes every step and never touches the
/// checkpoint's step.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryMode {
    Resume(ContributionStep),
    Finalize,
}

impl EntryMode {
    pub fn new(checkpoint: &ParticipantCheckpoint, finalize: bool) -> Self {
        match finalize {
            true => EntryMode::Finalize,
            false => EntryMode::Resume(checkpoint.current_step),
        }
    }

    /// Returns `true` if `step` must be executed in this mode.
    pub fn executes(&self, step: ContributionStep) -> bool {
        match self {
            EntryMode::Resume(current) => *current <= step,
            EntryMode::Finalize => true,
        }
    }

    pub fn is_finalizing(&self) -> bool {
        matches!(self, EntryMode::Finalize)
    }
}

/// The remote and local services a contribution is carried out with.
#[derive(Clone)]
pub struct Collaborators {
    pub transfer: Arc<dyn ObjectTransfer>,
    pub checkpoints: Arc<dyn CheckpointAuthority>,
    pub computer: Arc<dyn ArtifactComputer>,
    pub verifier: Arc<dyn VerificationService>,
}

///
/// Drives one participant through the download, compute, upload and verify
/// steps of a single circuit.
///
pub struct Contribute {
    environment: Environment,
    participant: ParticipantKey,
    contributor_name: String,
    randomness: SecretString,
    collaborators: Collaborators,
}

/// The local files and storage keys of one run.
struct Artifacts {
    predecessor_key: String,
    predecessor_path: PathBuf,
    target_suffix: String,
    target_key: String,
    target_path: PathBuf,
    transcript_path: PathBuf,
}

impl Artifacts {
    fn new(directory: &Path, circuit: &Circuit, mode: EntryMode) -> Self {
        let predecessor = ContributionIndex::new(circuit.completed_contributions);
        let predecessor_suffix = predecessor.to_string();
        let target_suffix = match mode {
            EntryMode::Resume(_) => predecessor.next().to_string(),
            EntryMode::Finalize => FINAL_CONTRIBUTION_SUFFIX.to_string(),
        };

        Self {
            predecessor_key: artifact_storage_key(&circuit.prefix, &predecessor_suffix),
            predecessor_path: directory.join(artifact_file_name(&circuit.prefix, &predecessor_suffix)),
            target_key: artifact_storage_key(&circuit.prefix, &target_suffix),
            target_path: directory.join(artifact_file_name(&circuit.prefix, &target_suffix)),
            transcript_path: transcript_path(directory, &circuit.prefix, &target_suffix),
            target_suffix,
        }
    }
}

impl Contribute {
    pub fn new(
        environment: Environment,
        participant: ParticipantKey,
        contributor_name: impl Into<String>,
        randomness: SecretString,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            environment,
            participant,
            contributor_name: contributor_name.into(),
            randomness,
            collaborators,
        }
    }

    ///
    /// Executes the remaining steps for `circuit`, starting where `checkpoint`
    /// left off, or every step when `finalize` is set.
    ///
    /// A negative verification verdict is returned as a normal outcome.
    /// Every other failure aborts the run; the checkpoint keeps whatever
    /// progress was made, so calling `run` again resumes from there.
    ///
    pub async fn run(
        &self,
        circuit: &Circuit,
        checkpoint: ParticipantCheckpoint,
        finalize: bool,
    ) -> Result<ContributionOutcome, ContributeError> {
        let checkpoint = checkpoint.validate()?;
        let expiration_secs = self.environment.presigned_url_expiration()?;

        let mode = EntryMode::new(&checkpoint, finalize);
        let guard = TimeoutGuard::from_window(checkpoint.contribution_started_at, circuit.timeout_window);
        let directory = self.environment.output_directory();
        fs_err::create_dir_all(directory)?;
        let artifacts = Artifacts::new(directory, circuit, mode);

        info!(
            "Contributing to circuit {} (position {}) as {}: {:?}",
            circuit.id, circuit.sequence_position, self.participant, mode
        );

        let mut outcome = ContributionOutcome {
            circuit_id: circuit.id.clone(),
            sequence_position: circuit.sequence_position,
            artifact: artifacts.target_suffix.clone(),
            contribution_hash: None,
            timings: StepTimings::default(),
            verification: None,
        };

        if mode.executes(ContributionStep::Downloading) {
            self.ensure_in_time(&guard).await?;
            let started = Instant::now();
            self.download(circuit, &artifacts, guard).await?;
            outcome.timings.downloading = Some(started.elapsed());
            self.advance(mode, ContributionStep::Computing).await?;
        }

        if mode.executes(ContributionStep::Computing) {
            self.ensure_in_time(&guard).await?;
            let started = Instant::now();
            let contribution_hash = self.compute(circuit, &artifacts, mode, guard).await?;
            let elapsed = started.elapsed();
            outcome.timings.computing = Some(elapsed);

            let record = ContributionRecord {
                circuit_id: circuit.id.clone(),
                contribution_hash: contribution_hash.clone(),
                computation_time: elapsed.as_millis() as u64,
            };
            self.collaborators
                .checkpoints
                .store_contribution_record(&self.participant, &record)
                .await?;
            outcome.contribution_hash = Some(contribution_hash);
            self.advance(mode, ContributionStep::Uploading).await?;
        }

        if mode.executes(ContributionStep::Uploading) {
            self.ensure_in_time(&guard).await?;
            let started = Instant::now();
            // A session started before this run recomputed the artifact holds parts of other bytes.
            let existing = match mode {
                EntryMode::Resume(step) if step >= ContributionStep::Uploading => checkpoint.temp_upload.clone(),
                EntryMode::Resume(_) | EntryMode::Finalize => None,
            };
            self.upload(circuit, &artifacts, existing, expiration_secs, guard)
                .await?;
            outcome.timings.uploading = Some(started.elapsed());
            self.advance(mode, ContributionStep::Verifying).await?;
        }

        if mode.executes(ContributionStep::Verifying) {
            self.ensure_in_time(&guard).await?;
            let started = Instant::now();
            let result = self.verify(circuit, guard).await?;
            outcome.timings.verifying = Some(started.elapsed());

            match result.valid {
                true => info!("Contribution {} to circuit {} is valid", outcome.artifact, circuit.id),
                false => warn!("Contribution {} to circuit {} was rejected", outcome.artifact, circuit.id),
            }
            outcome.verification = Some(result);
        }

        Ok(outcome)
    }

    ///
    /// Fails with the remaining lockout if the attempt's deadline has passed.
    ///
    async fn ensure_in_time(&self, guard: &TimeoutGuard) -> Result<(), ContributeError> {
        if !guard.is_expired() {
            return Ok(());
        }

        let retry_at = self.collaborators.checkpoints.next_retry_time(&self.participant).await?;
        let lockout = match retry_at {
            Some(retry_at) => remaining(retry_at, now_millis()),
            None => RemainingTime::default(),
        };
        error!("The contribution deadline has passed, {} may retry in {}", self.participant, lockout);
        Err(ContributeError::TimeoutExpired {
            remaining: lockout,
            retry_at,
        })
    }

    async fn advance(&self, mode: EntryMode, step: ContributionStep) -> Result<(), ContributeError> {
        if mode.is_finalizing() {
            return Ok(());
        }
        info!("Advancing {} to {}", self.participant, step);
        self.collaborators
            .checkpoints
            .set_participant_step(&self.participant, step)
            .await
    }

    fn start_status(&self, message: String, circuit: &Circuit, step: ContributionStep, guard: TimeoutGuard) -> StatusHandle {
        let expected = circuit.average_timings.for_step(step);
        if let Some(expected) = expected {
            info!("{} usually takes {}", step, format_duration(expected));
        }
        StatusHandle::start(message, expected, guard, self.environment.show_progress())
    }

    async fn download(&self, circuit: &Circuit, artifacts: &Artifacts, guard: TimeoutGuard) -> Result<(), ContributeError> {
        let status = self.start_status(
            format!("Downloading {}", artifacts.predecessor_key),
            circuit,
            ContributionStep::Downloading,
            guard,
        );

        remove_file_if_exists(&artifacts.predecessor_path)?;
        self.collaborators
            .transfer
            .download(
                self.environment.bucket(),
                &artifacts.predecessor_key,
                &artifacts.predecessor_path,
            )
            .await
            .map_err(|e| {
                error!("Failed to download {}: {}", artifacts.predecessor_key, e);
                e
            })?;

        status.finish(format!("Downloaded {}", artifacts.predecessor_key));
        Ok(())
    }

    /// Computes the new artifact and returns its contribution hash.
    async fn compute(
        &self,
        circuit: &Circuit,
        artifacts: &Artifacts,
        mode: EntryMode,
        guard: TimeoutGuard,
    ) -> Result<String, ContributeError> {
        let status = self.start_status(
            format!("Computing {}", artifact_file_name(&circuit.prefix, &artifacts.target_suffix)),
            circuit,
            ContributionStep::Computing,
            guard,
        );

        remove_file_if_exists(&artifacts.target_path)?;
        let mut transcript = TranscriptLogger::create(&artifacts.transcript_path)?;
        self.collaborators
            .computer
            .compute(
                &artifacts.predecessor_path,
                &artifacts.target_path,
                &self.contributor_name,
                &self.randomness,
                &mut transcript,
                mode.is_finalizing(),
            )
            .await?;

        let contribution_hash = extract_contribution_hash(transcript.contents()).ok_or_else(|| {
            error!("No contribution hash in {}", transcript.path().display());
            ContributeError::MissingContributionHash(transcript.path().display().to_string())
        })?;

        status.finish(format!("Computed contribution {}", contribution_hash));
        Ok(contribution_hash)
    }

    async fn upload(
        &self,
        circuit: &Circuit,
        artifacts: &Artifacts,
        existing: Option<UploadSession>,
        expiration_secs: u64,
        guard: TimeoutGuard,
    ) -> Result<(), ContributeError> {
        let status = self.start_status(
            format!("Uploading {}", artifacts.target_key),
            circuit,
            ContributionStep::Uploading,
            guard,
        );

        let upload = MultipartUpload::new(
            self.collaborators.transfer.as_ref(),
            self.collaborators.checkpoints.as_ref(),
            &self.participant,
            self.environment.bucket(),
            self.environment.part_size(),
            expiration_secs,
        )
        .with_concurrency(self.environment.upload_concurrency())
        .with_progress_bar(status.progress_bar(0));

        upload
            .upload(&artifacts.target_path, &artifacts.target_key, existing)
            .await?;

        status.finish(format!("Uploaded {}", artifacts.target_key));
        Ok(())
    }

    async fn verify(&self, circuit: &Circuit, guard: TimeoutGuard) -> Result<VerificationResult, ContributeError> {
        let status = self.start_status(
            format!("Verifying the contribution to {}", circuit.id),
            circuit,
            ContributionStep::Verifying,
            guard,
        );

        let request = VerificationRequest {
            ceremony_id: self.participant.ceremony_id.clone(),
            circuit_id: circuit.id.clone(),
            participant_id: self.participant.participant_id.clone(),
        };
        let timeout = self.environment.verify_timeout();
        let result = match tokio::time::timeout(timeout, self.collaborators.verifier.verify(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                error!("Verification of {} did not answer within {:?}", circuit.id, timeout);
                return Err(ContributeError::VerificationTimeout(timeout.as_secs()));
            }
        };

        status.finish(format!(
            "Verified in {} (contribution took {})",
            format_duration(Duration::from_millis(result.verify_duration_ms)),
            format_duration(Duration::from_millis(result.full_duration_ms))
        ));
        Ok(result)
    }
}

///
/// Returns the entropy typed by the contributor, or fresh random bytes in hex
/// if they leave the prompt empty.
///
fn read_entropy(entropy: Option<String>) -> Result<SecretString> {
    let entropy = match entropy {
        Some(entropy) => entropy,
        None => Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Enter some random text to use as entropy (leave empty to generate it)")
            .allow_empty_password(true)
            .interact()
            .context("Failed to read the entropy")?,
    };

    if !entropy.is_empty() {
        return Ok(SecretString::new(entropy));
    }

    let mut bytes = [0u8; GENERATED_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Ok(SecretString::new(hex::encode(bytes)))
}

///
/// Runs a contribution for the options given on the command line, until it
/// completes or the contributor presses Ctrl-C.
///
pub async fn start_contribution(opts: ContributeOptions) -> Result<ContributionOutcome> {
    dotenv::dotenv().ok();

    let mut environment = Environment::from_env()?;
    if let Some(url) = opts.coordinator_api_url {
        environment = environment.with_coordinator_api_url(url);
    }
    if let Some(directory) = opts.output_directory {
        environment = environment.with_output_directory(directory);
    }
    if let Some(concurrency) = opts.upload_concurrency {
        environment = environment.with_upload_concurrency(concurrency)?;
    }
    initialize_logger(&environment)?;

    let randomness = match &opts.beacon {
        Some(beacon) => {
            hex::decode(beacon).context("The beacon must be a hex string")?;
            SecretString::new(beacon.clone())
        }
        None => read_entropy(opts.entropy)?,
    };

    let participant = ParticipantKey::new(opts.ceremony_id, opts.participant_id);
    let client = Arc::new(CoordinatorClient::new(&environment)?);
    let circuit = client
        .get_circuit(&participant.ceremony_id, &opts.circuit_id)
        .await
        .context("Failed to fetch the circuit")?;
    let checkpoint = client
        .get_participant_checkpoint(&participant)
        .await
        .context("Failed to fetch the participant checkpoint")?;

    let collaborators = Collaborators {
        transfer: client.clone(),
        checkpoints: client.clone(),
        computer: Arc::new(ProcessComputer::new(opts.computer)),
        verifier: client,
    };
    let contribute = Contribute::new(
        environment,
        participant,
        opts.contributor_name,
        randomness,
        collaborators,
    );

    tokio::select! {
        outcome = contribute.run(&circuit, checkpoint, opts.beacon.is_some()) => Ok(outcome?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, the contribution can be resumed from its last checkpoint");
            Err(anyhow::anyhow!("The contribution was interrupted"))
        }
    }
}

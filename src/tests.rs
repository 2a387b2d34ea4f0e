use crate::{
    commands::{Collaborators, Contribute},
    environment::Environment,
    errors::{ContributeError, ErrorCategory},
    interfaces::ObjectTransfer,
    objects::{
        AverageTimings,
        Circuit,
        ContributionStep,
        ParticipantCheckpoint,
        ParticipantKey,
        UploadSession,
        UploadedPart,
    },
    testing::{Call, CallLog, FixedVerifier, MemoryCheckpoints, MemoryStorage, ScriptedComputer, CONTRIBUTION_HASH},
    timeout::now_millis,
};

use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

const BUCKET: &str = "ceremony-bucket";
const CONTRIBUTOR: &str = "alice";
const ENTROPY: &str = "entropy";
const PART_SIZE: u64 = 64;
const PREDECESSOR_KEY: &str = "circuits/multiplier/contributions/multiplier_00003.zkey";
const TARGET_KEY: &str = "circuits/multiplier/contributions/multiplier_00004.zkey";
const FINAL_KEY: &str = "circuits/multiplier/contributions/multiplier_final.zkey";

lazy_static! {
    static ref PREDECESSOR: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    static ref ARTIFACT: Vec<u8> = ScriptedComputer::expected_artifact(&PREDECESSOR, CONTRIBUTOR, ENTROPY);
    static ref CIRCUIT: Circuit = Circuit {
        id: "circuit-1".to_string(),
        sequence_position: 2,
        prefix: "multiplier".to_string(),
        completed_contributions: 3,
        average_timings: AverageTimings {
            downloading: 1_000,
            computing: 60_000,
            uploading: 5_000,
            verifying: 30_000,
        },
        timeout_window: None,
    };
}

/// Number of parts the artifact is uploaded in.
fn number_of_parts() -> u32 {
    ((ARTIFACT.len() as u64 + PART_SIZE - 1) / PART_SIZE) as u32
}

struct Harness {
    log: CallLog,
    storage: Arc<MemoryStorage>,
    checkpoints: Arc<MemoryCheckpoints>,
    directory: TempDir,
    environment: Environment,
}

impl Harness {
    fn new(checkpoint: ParticipantCheckpoint) -> Self {
        let log = CallLog::default();
        let storage = Arc::new(MemoryStorage::with_log(log.clone()));
        storage.put_object(BUCKET, PREDECESSOR_KEY, PREDECESSOR.clone());
        let checkpoints = Arc::new(MemoryCheckpoints::with_log(checkpoint, log.clone()));

        let directory = tempfile::tempdir().unwrap();
        let environment = Environment::new(BUCKET)
            .with_part_size(PART_SIZE)
            .unwrap()
            .with_presigned_url_expiration(900)
            .with_output_directory(directory.path().to_path_buf())
            .with_progress(false);

        Self {
            log,
            storage,
            checkpoints,
            directory,
            environment,
        }
    }

    fn computer(&self) -> ScriptedComputer {
        ScriptedComputer::with_log(self.log.clone())
    }

    fn verifier(&self, valid: bool) -> FixedVerifier {
        FixedVerifier::with_log(valid, self.log.clone())
    }

    fn contribute(&self, computer: ScriptedComputer, verifier: FixedVerifier) -> Contribute {
        Contribute::new(
            self.environment.clone(),
            ParticipantKey::new("ceremony", "participant"),
            CONTRIBUTOR,
            SecretString::new(ENTROPY.to_string()),
            Collaborators {
                transfer: self.storage.clone(),
                checkpoints: self.checkpoints.clone(),
                computer: Arc::new(computer),
                verifier: Arc::new(verifier),
            },
        )
    }

    fn default_contribute(&self) -> Contribute {
        self.contribute(self.computer(), self.verifier(true))
    }

    fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.log.lock().unwrap().clear();
    }
}

/// The calls of a sequential upload transmitting `parts` of an upload
/// covering every part of the artifact.
fn sequential_upload(parts: std::ops::RangeInclusive<u32>) -> Vec<Call> {
    let mut calls = vec![Call::AuthorizeParts(parts.clone().collect())];
    for part_number in parts {
        calls.push(Call::TransmitPart(part_number));
        calls.push(Call::AddUploadedPart(part_number));
    }
    calls.push(Call::FinalizeTransfer((1..=number_of_parts()).collect()));
    calls
}

#[tokio::test]
async fn test_fresh_contribution() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));

    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    let mut expected = vec![
        Call::Download(PREDECESSOR_KEY.to_string()),
        Call::SetStep(ContributionStep::Computing),
        Call::Compute { is_finalizing: false },
        Call::StoreRecord(CONTRIBUTION_HASH.to_string()),
        Call::SetStep(ContributionStep::Uploading),
        Call::OpenTransfer(TARGET_KEY.to_string()),
        Call::SetTempUpload("upload-1".to_string()),
    ];
    expected.extend(sequential_upload(1..=number_of_parts()));
    expected.push(Call::SetStep(ContributionStep::Verifying));
    expected.push(Call::Verify);
    assert_eq!(expected, harness.calls());

    assert!(outcome.is_valid());
    assert_eq!("00004", outcome.artifact);
    assert_eq!(Some(CONTRIBUTION_HASH.to_string()), outcome.contribution_hash);
    assert!(outcome.timings.downloading.is_some());
    assert!(outcome.timings.computing.is_some());
    assert!(outcome.timings.uploading.is_some());
    assert!(outcome.timings.verifying.is_some());

    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
    assert_eq!(ContributionStep::Verifying, harness.checkpoints.checkpoint().current_step);

    let records = harness.checkpoints.records();
    assert_eq!(1, records.len());
    assert_eq!("circuit-1", records[0].circuit_id);
    assert_eq!(CONTRIBUTION_HASH, records[0].contribution_hash);

    let transcript = fs_err::read_to_string(harness.directory.path().join("multiplier_00004.log")).unwrap();
    assert!(transcript.contains("Contribution Hash:"));
}

#[tokio::test]
async fn test_resume_after_failed_transmission() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));
    harness.storage.fail_transmission_of(5);

    let error = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();
    assert!(matches!(error, ContributeError::FailedPartTransmission(5, _)));
    assert_eq!(ErrorCategory::Transfer, error.category());
    assert!(error.is_retryable());
    assert_eq!(None, harness.storage.object(BUCKET, TARGET_KEY));

    let checkpoint = harness.checkpoints.checkpoint();
    assert_eq!(ContributionStep::Uploading, checkpoint.current_step);
    assert_eq!(4, checkpoint.temp_upload.as_ref().unwrap().chunks.len());

    harness.storage.clear_failures();
    harness.clear_calls();
    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, checkpoint, false)
        .await
        .unwrap();

    let mut expected = sequential_upload(5..=number_of_parts());
    expected.push(Call::SetStep(ContributionStep::Verifying));
    expected.push(Call::Verify);
    assert_eq!(expected, harness.calls());
    assert_eq!(number_of_parts() - 4, harness.storage.transmitted_parts().len() as u32);

    assert!(outcome.is_valid());
    assert_eq!(None, outcome.contribution_hash);
    assert_eq!(None, outcome.timings.downloading);
    assert_eq!(None, outcome.timings.computing);
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
}

#[tokio::test]
async fn test_failed_download_keeps_checkpoint() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));
    harness.storage.fail_download();

    let error = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::FailedDownload(_)));
    assert_eq!(ErrorCategory::Transfer, error.category());
    assert!(error.is_retryable());
    assert_eq!(vec![Call::Download(PREDECESSOR_KEY.to_string())], harness.calls());
    assert_eq!(ContributionStep::NotStarted, harness.checkpoints.checkpoint().current_step);

    harness.storage.clear_failures();
    harness.clear_calls();
    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    assert!(outcome.is_valid());
    assert_eq!(Call::Download(PREDECESSOR_KEY.to_string()), harness.calls()[0]);
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
}

#[tokio::test]
async fn test_recomputed_artifact_abandons_earlier_session() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));

    // Parts of an earlier artifact, transmitted to the same key before the attempt was reset.
    let upload_id = harness.storage.open_transfer(BUCKET, TARGET_KEY).await.unwrap();
    let authorizations = harness
        .storage
        .authorize_parts(&upload_id, BUCKET, TARGET_KEY, &[1, 2], 900)
        .await
        .unwrap();
    let mut earlier = UploadSession::new(upload_id.clone());
    for authorization in &authorizations {
        let token = harness
            .storage
            .transmit_part(authorization, vec![0xEE; PART_SIZE as usize], "application/octet-stream")
            .await
            .unwrap();
        earlier.record(UploadedPart::new(authorization.part_number, token)).unwrap();
    }
    let mut checkpoint = harness.checkpoints.checkpoint();
    checkpoint.temp_upload = Some(earlier);
    harness.clear_calls();

    harness
        .default_contribute()
        .run(&CIRCUIT, checkpoint, false)
        .await
        .unwrap();

    let calls = harness.calls();
    assert!(calls.contains(&Call::OpenTransfer(TARGET_KEY.to_string())));
    assert!(calls.contains(&Call::AuthorizeParts((1..=number_of_parts()).collect())));
    assert_ne!(Some(upload_id), harness.checkpoints.checkpoint().temp_upload.map(|s| s.upload_id));
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
}

#[tokio::test]
async fn test_resume_at_uploading_without_session() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Uploading));
    fs_err::write(harness.directory.path().join("multiplier_00004.zkey"), &*ARTIFACT).unwrap();

    harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    let calls = harness.calls();
    assert_eq!(Call::OpenTransfer(TARGET_KEY.to_string()), calls[0]);
    assert!(!calls.iter().any(|call| matches!(call, Call::Download(_) | Call::Compute { .. })));
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
}

#[tokio::test]
async fn test_resume_at_verifying() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Verifying));

    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    assert_eq!(vec![Call::Verify], harness.calls());
    assert!(outcome.is_valid());
    assert_eq!(None, outcome.timings.uploading);
    assert!(outcome.timings.verifying.is_some());
}

#[tokio::test]
async fn test_completed_checkpoint_runs_nothing() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Completed));

    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    assert!(harness.calls().is_empty());
    assert_eq!(None, outcome.verification);
    assert!(!outcome.is_valid());
}

#[tokio::test]
async fn test_finalize_executes_every_step() {
    let mut checkpoint = ParticipantCheckpoint::new(ContributionStep::Verifying);
    let mut stale = UploadSession::new("stale-upload");
    stale.record(UploadedPart::new(1, "stale-token")).unwrap();
    checkpoint.temp_upload = Some(stale);
    let harness = Harness::new(checkpoint);

    let outcome = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), true)
        .await
        .unwrap();

    let calls = harness.calls();
    assert_eq!(Call::Download(PREDECESSOR_KEY.to_string()), calls[0]);
    assert_eq!(Call::Compute { is_finalizing: true }, calls[1]);
    assert_eq!(Call::OpenTransfer(FINAL_KEY.to_string()), calls[3]);
    assert_eq!(Some(&Call::Verify), calls.last());
    assert!(!calls.iter().any(|call| matches!(call, Call::SetStep(_))));

    assert_eq!("final", outcome.artifact);
    assert!(outcome.is_valid());
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, FINAL_KEY));
    assert_eq!(ContributionStep::Verifying, harness.checkpoints.checkpoint().current_step);
}

#[tokio::test]
async fn test_missing_contribution_hash() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));

    let error = harness
        .contribute(harness.computer().without_hash(), harness.verifier(true))
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::MissingContributionHash(_)));
    assert_eq!(ErrorCategory::DataIntegrity, error.category());
    assert!(!error.is_retryable());
    assert_eq!(
        vec![
            Call::Download(PREDECESSOR_KEY.to_string()),
            Call::SetStep(ContributionStep::Computing),
            Call::Compute { is_finalizing: false },
        ],
        harness.calls()
    );
    assert!(harness.checkpoints.records().is_empty());
}

#[tokio::test]
async fn test_failed_computation() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Computing));
    fs_err::write(harness.directory.path().join("multiplier_00003.zkey"), &*PREDECESSOR).unwrap();

    let error = harness
        .contribute(harness.computer().failing(), harness.verifier(true))
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert_eq!(ErrorCategory::Computation, error.category());
    assert_eq!(vec![Call::Compute { is_finalizing: false }], harness.calls());
    assert_eq!(ContributionStep::Computing, harness.checkpoints.checkpoint().current_step);
}

#[tokio::test]
async fn test_missing_expiration_fails_before_any_call() {
    let mut harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));
    harness.environment = Environment::new(BUCKET)
        .with_output_directory(harness.directory.path().to_path_buf())
        .with_progress(false);

    let error = harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::MissingConfiguration(_)));
    assert_eq!(ErrorCategory::Configuration, error.category());
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_checkpoint_fails_before_any_call() {
    let mut checkpoint = ParticipantCheckpoint::new(ContributionStep::Uploading);
    checkpoint.temp_upload = Some(UploadSession {
        upload_id: "upload".to_string(),
        chunks: vec![UploadedPart::new(0, "token")],
    });
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Uploading));

    let error = harness
        .default_contribute()
        .run(&CIRCUIT, checkpoint, false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::InvalidCheckpoint(_)));
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_expired_deadline_reports_lockout() {
    let now = now_millis();
    let mut checkpoint = ParticipantCheckpoint::new(ContributionStep::Downloading);
    checkpoint.contribution_started_at = Some(now - 10_000);
    let harness = Harness::new(checkpoint);
    harness.checkpoints.set_retry_time(now + 3_600_000);

    let mut circuit = CIRCUIT.clone();
    circuit.timeout_window = Some(1_000);

    let error = harness
        .default_contribute()
        .run(&circuit, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    match error {
        ContributeError::TimeoutExpired { remaining, retry_at } => {
            assert_eq!(Some(now + 3_600_000), retry_at);
            assert_eq!(0, remaining.days);
            let seconds = remaining.hours * 3600 + remaining.minutes * 60 + remaining.seconds;
            assert!((3_590..=3_600).contains(&seconds));
        }
        error => panic!("unexpected error {}", error),
    }
    assert_eq!(vec![Call::NextRetryTime], harness.calls());
}

#[tokio::test]
async fn test_deadline_not_reached() {
    let mut checkpoint = ParticipantCheckpoint::new(ContributionStep::Verifying);
    checkpoint.contribution_started_at = Some(now_millis());
    let harness = Harness::new(checkpoint);

    let mut circuit = CIRCUIT.clone();
    circuit.timeout_window = Some(3_600_000);

    harness
        .default_contribute()
        .run(&circuit, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();
    assert_eq!(vec![Call::Verify], harness.calls());
}

#[tokio::test]
async fn test_negative_verdict_is_an_outcome() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Verifying));

    let outcome = harness
        .contribute(harness.computer(), harness.verifier(false))
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    assert!(!outcome.is_valid());
    let verification = outcome.verification.unwrap();
    assert!(!verification.valid);
    assert_eq!(1_200, verification.verify_duration_ms);
    assert_eq!(5_400, verification.full_duration_ms);
}

#[tokio::test]
async fn test_failed_verification() {
    let harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Verifying));

    let error = harness
        .contribute(harness.computer(), harness.verifier(true).failing())
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::FailedVerification(_)));
    assert_eq!(ErrorCategory::Verification, error.category());
}

#[tokio::test]
async fn test_verification_timeout() {
    let mut harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::Verifying));
    harness.environment = harness.environment.clone().with_verify_timeout(Duration::from_millis(50));

    let error = harness
        .contribute(
            harness.computer(),
            harness.verifier(true).delayed(Duration::from_secs(5)),
        )
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap_err();

    assert!(matches!(error, ContributeError::VerificationTimeout(_)));
    assert_eq!(ErrorCategory::Verification, error.category());
}

#[tokio::test]
async fn test_parallel_upload() {
    let mut harness = Harness::new(ParticipantCheckpoint::new(ContributionStep::NotStarted));
    harness.environment = harness.environment.clone().with_upload_concurrency(4).unwrap();

    harness
        .default_contribute()
        .run(&CIRCUIT, harness.checkpoints.checkpoint(), false)
        .await
        .unwrap();

    let mut recorded: Vec<u32> = harness
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::AddUploadedPart(part_number) => Some(part_number),
            _ => None,
        })
        .collect();
    recorded.sort_unstable();
    assert_eq!((1..=number_of_parts()).collect::<Vec<_>>(), recorded);
    assert_eq!(Some(ARTIFACT.clone()), harness.storage.object(BUCKET, TARGET_KEY));
}

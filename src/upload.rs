//! Resumable multipart upload of a contribution artifact.

use crate::{
    errors::ContributeError,
    interfaces::{CheckpointAuthority, ObjectTransfer, PartAuthorization},
    objects::{ParticipantKey, UploadSession, UploadedPart},
};

use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::ProgressBar;
use std::{
    collections::HashMap,
    io::SeekFrom,
    ops::Range,
    path::Path,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, error, info, warn};

/// Content type of every transmitted part.
pub const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

///
/// The split of a file into fixed-size parts numbered from 1.
///
/// An empty file still has one (empty) part, so every upload goes through
/// the same open, authorize, transmit and finalize sequence.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartPlan {
    file_size: u64,
    part_size: u64,
}

impl PartPlan {
    pub fn new(file_size: u64, part_size: u64) -> Self {
        Self {
            file_size,
            part_size: part_size.max(1),
        }
    }

    pub fn number_of_parts(&self) -> u32 {
        let parts = (self.file_size + self.part_size - 1) / self.part_size;
        parts.max(1) as u32
    }

    /// Returns the byte range of `part_number`, or `None` if it is out of the plan.
    pub fn range(&self, part_number: u32) -> Option<Range<u64>> {
        if part_number == 0 || part_number > self.number_of_parts() {
            return None;
        }
        let start = (part_number as u64 - 1) * self.part_size;
        let end = (start + self.part_size).min(self.file_size);
        Some(start..end)
    }

    pub fn part_numbers(&self) -> impl Iterator<Item = u32> {
        1..=self.number_of_parts()
    }
}

///
/// Uploads one local artifact through the object transfer authority,
/// persisting the upload id and every completed part to the checkpoint
/// authority as soon as they are known.
///
pub struct MultipartUpload<'a> {
    transfer: &'a dyn ObjectTransfer,
    checkpoints: &'a dyn CheckpointAuthority,
    participant: &'a ParticipantKey,
    bucket: &'a str,
    part_size: u64,
    expiration_secs: u64,
    concurrency: usize,
    progress_bar: ProgressBar,
}

impl<'a> MultipartUpload<'a> {
    pub fn new(
        transfer: &'a dyn ObjectTransfer,
        checkpoints: &'a dyn CheckpointAuthority,
        participant: &'a ParticipantKey,
        bucket: &'a str,
        part_size: u64,
        expiration_secs: u64,
    ) -> Self {
        Self {
            transfer,
            checkpoints,
            participant,
            bucket,
            part_size,
            expiration_secs,
            concurrency: 1,
            progress_bar: ProgressBar::hidden(),
        }
    }

    /// Transmits up to `concurrency` parts at the same time.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress_bar(mut self, progress_bar: ProgressBar) -> Self {
        self.progress_bar = progress_bar;
        self
    }

    ///
    /// Uploads `local_path` to `key`.
    ///
    /// Parts already recorded in `existing` are neither authorized nor
    /// transmitted again. Returns the session with every part recorded.
    ///
    pub async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        existing: Option<UploadSession>,
    ) -> Result<UploadSession, ContributeError> {
        let mut session = match existing {
            Some(session) if !session.upload_id.is_empty() => {
                info!(
                    "Resuming upload {} of {} with {} recorded parts",
                    session.upload_id,
                    key,
                    session.chunks.len()
                );
                session
            }
            _ => self.open(key).await?,
        };

        let file_size = tokio::fs::metadata(local_path).await?.len();
        let plan = PartPlan::new(file_size, self.part_size);
        let number_of_parts = plan.number_of_parts();

        if let Some(extra) = session.chunks.iter().find(|part| plan.range(part.part_number).is_none()) {
            warn!(
                "Upload {} records part {} but {} only has {} parts",
                session.upload_id,
                extra.part_number,
                local_path.display(),
                number_of_parts
            );
            return Err(ContributeError::IncompleteUpload {
                upload_id: session.upload_id.clone(),
                recorded: session.chunks.len(),
                expected: number_of_parts,
            });
        }

        let missing: Vec<u32> = plan.part_numbers().filter(|n| !session.contains(*n)).collect();
        info!(
            "Uploading {} ({} bytes) to {} in {} parts, {} remaining",
            local_path.display(),
            file_size,
            key,
            number_of_parts,
            missing.len()
        );

        self.progress_bar.set_length(number_of_parts as u64);
        self.progress_bar.set_position((number_of_parts as usize - missing.len()) as u64);

        if !missing.is_empty() {
            let authorizations = self.authorize(&session.upload_id, key, &missing).await?;
            self.transmit(local_path, &plan, authorizations, &mut session).await?;
        }

        let parts = session.completed_parts(number_of_parts)?;
        self.transfer
            .finalize_transfer(&session.upload_id, self.bucket, key, &parts)
            .await
            .map_err(|e| {
                error!("Failed to finalize upload {}: {}", session.upload_id, e);
                e
            })?;

        info!("Completed upload {} of {}", session.upload_id, key);
        Ok(session)
    }

    async fn open(&self, key: &str) -> Result<UploadSession, ContributeError> {
        let upload_id = self.transfer.open_transfer(self.bucket, key).await?;
        if upload_id.is_empty() {
            return Err(ContributeError::FailedTransferOpen(key.to_string()));
        }
        info!("Opened upload {} for {}", upload_id, key);

        let session = UploadSession::new(upload_id);
        self.checkpoints
            .set_temp_upload_session(self.participant, &session)
            .await?;
        Ok(session)
    }

    /// Requests one authorization per missing part and checks none is absent.
    async fn authorize(
        &self,
        upload_id: &str,
        key: &str,
        missing: &[u32],
    ) -> Result<Vec<PartAuthorization>, ContributeError> {
        let authorizations = self
            .transfer
            .authorize_parts(upload_id, self.bucket, key, missing, self.expiration_secs)
            .await?;

        let mut by_part: HashMap<u32, PartAuthorization> = authorizations
            .into_iter()
            .map(|authorization| (authorization.part_number, authorization))
            .collect();

        missing
            .iter()
            .map(|part_number| {
                by_part.remove(part_number).ok_or_else(|| {
                    error!("Upload {} received no authorization for part {}", upload_id, part_number);
                    ContributeError::FailedPartAuthorization(upload_id.to_string())
                })
            })
            .collect()
    }

    ///
    /// Transmits the authorized parts, at most `concurrency` at a time.
    ///
    /// Completion tokens are persisted and recorded one at a time as the
    /// transmissions finish, in whatever order they finish.
    ///
    async fn transmit(
        &self,
        local_path: &Path,
        plan: &PartPlan,
        authorizations: Vec<PartAuthorization>,
        session: &mut UploadSession,
    ) -> Result<(), ContributeError> {
        let upload_id = session.upload_id.clone();
        let transfer = self.transfer;
        let upload_id_ref = upload_id.as_str();

        let mut transmissions = stream::iter(authorizations.into_iter().map(|authorization| {
            let range = plan.range(authorization.part_number);
            async move {
                let range = range.ok_or(ContributeError::FailedPartAuthorization(upload_id_ref.to_string()))?;
                let body = read_part(local_path, range).await?;
                debug!(
                    "Transmitting part {} of upload {} ({} bytes)",
                    authorization.part_number,
                    upload_id_ref,
                    body.len()
                );

                let completion_token = transfer
                    .transmit_part(&authorization, body, ARTIFACT_CONTENT_TYPE)
                    .await
                    .map_err(|e| {
                        error!("Part {} of upload {} failed: {}", authorization.part_number, upload_id_ref, e);
                        ContributeError::FailedPartTransmission(authorization.part_number, upload_id_ref.to_string())
                    })?;
                Ok::<_, ContributeError>(UploadedPart::new(authorization.part_number, completion_token))
            }
        }))
        .buffer_unordered(self.concurrency);

        while let Some(part) = transmissions.try_next().await? {
            self.checkpoints.add_uploaded_part(self.participant, &part).await?;
            session.record(part)?;
            self.progress_bar.inc(1);
        }

        Ok(())
    }
}

/// Reads the bytes of `range` from the file at `path`.
async fn read_part(path: &Path, range: Range<u64>) -> Result<Vec<u8>, ContributeError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut body = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut body).await?;
    Ok(body)
}

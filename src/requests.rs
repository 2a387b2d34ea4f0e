use crate::{
    environment::Environment,
    errors::ContributeError,
    interfaces::{CheckpointAuthority, ObjectTransfer, PartAuthorization, VerificationService},
    objects::{
        Circuit,
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
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use url::Url;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectLocation<'a> {
    bucket: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizePartsRequest<'a> {
    upload_id: &'a str,
    bucket: &'a str,
    key: &'a str,
    part_numbers: &'a [u32],
    expiration_seconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteUploadRequest<'a> {
    upload_id: &'a str,
    bucket: &'a str,
    key: &'a str,
    parts: &'a [UploadedPart],
}

#[derive(Serialize)]
struct StepUpdate {
    step: ContributionStep,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenUploadResponse {
    upload_id: String,
}

#[derive(Deserialize)]
struct DownloadUrlResponse {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryResponse {
    #[serde(default)]
    retry_at: Option<u64>,
}

///
/// The ceremony coordinator's HTTP API, acting as object transfer authority,
/// checkpoint authority and verification service.
///
pub struct CoordinatorClient {
    client: Client,
    coordinator_api_url: Url,
    token: Option<String>,
}

impl CoordinatorClient {
    pub fn new(environment: &Environment) -> Result<Self, ContributeError> {
        Ok(Self {
            client: Client::new(),
            coordinator_api_url: environment.coordinator_api_url()?.clone(),
            token: environment.coordinator_token().map(str::to_string),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ContributeError> {
        Ok(self.coordinator_api_url.join(path)?)
    }

    fn participant_path(participant: &ParticipantKey, resource: &str) -> String {
        format!(
            "/v1/ceremonies/{}/participants/{}/{}",
            participant.ceremony_id, participant.participant_id, resource
        )
    }

    /// Sends an authenticated request to the coordinator.
    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Response, ContributeError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        match request.send().await {
            Ok(response) => Ok(response),
            Err(_) => {
                error!("Request ({}) to the coordinator failed", path);
                Err(ContributeError::FailedRequest(
                    path.to_string(),
                    self.coordinator_api_url.to_string(),
                ))
            }
        }
    }

    ///
    /// Attempts to fetch the circuit `circuit_id` of `ceremony_id`.
    ///
    pub async fn get_circuit(&self, ceremony_id: &str, circuit_id: &str) -> Result<Circuit, ContributeError> {
        let path = format!("/v1/ceremonies/{}/circuits/{}", ceremony_id, circuit_id);
        let response = self.send(self.client.get(self.endpoint(&path)?), &path).await?;
        if !response.status().is_success() {
            error!("Failed to fetch circuit {} ({})", circuit_id, response.status());
            return Err(ContributeError::FailedRequest(
                path,
                self.coordinator_api_url.to_string(),
            ));
        }

        let circuit = serde_json::from_slice::<Circuit>(&response.bytes().await?)?;
        debug!("Decoded circuit: {:?}", circuit);
        Ok(circuit)
    }

    async fn update_checkpoint<B: Serialize + ?Sized>(
        &self,
        participant: &ParticipantKey,
        resource: &str,
        body: &B,
    ) -> Result<(), ContributeError> {
        let path = Self::participant_path(participant, resource);
        let request = match resource {
            "temp-upload/parts" | "contributions" => self.client.post(self.endpoint(&path)?),
            _ => self.client.put(self.endpoint(&path)?),
        };

        let response = self.send(request.json(body), &path).await?;
        if !response.status().is_success() {
            error!("Failed to update {} of {} ({})", resource, participant, response.status());
            return Err(ContributeError::FailedCheckpointUpdate(path));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectTransfer for CoordinatorClient {
    async fn open_transfer(&self, bucket: &str, key: &str) -> Result<String, ContributeError> {
        let path = "/v1/storage/multipart/open";
        let request = self
            .client
            .post(self.endpoint(path)?)
            .json(&ObjectLocation { bucket, key });

        let response = self.send(request, path).await?;
        if !response.status().is_success() {
            error!("Failed to open an upload for {} ({})", key, response.status());
            return Err(ContributeError::FailedTransferOpen(key.to_string()));
        }

        let open = serde_json::from_slice::<OpenUploadResponse>(&response.bytes().await?)?;
        Ok(open.upload_id)
    }

    async fn authorize_parts(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_numbers: &[u32],
        expiration_secs: u64,
    ) -> Result<Vec<PartAuthorization>, ContributeError> {
        let path = "/v1/storage/multipart/authorize";
        let request = self.client.post(self.endpoint(path)?).json(&AuthorizePartsRequest {
            upload_id,
            bucket,
            key,
            part_numbers,
            expiration_seconds: expiration_secs,
        });

        let response = self.send(request, path).await?;
        if !response.status().is_success() {
            error!("Failed to authorize parts of upload {} ({})", upload_id, response.status());
            return Err(ContributeError::FailedPartAuthorization(upload_id.to_string()));
        }

        Ok(serde_json::from_slice::<Vec<PartAuthorization>>(&response.bytes().await?)?)
    }

    async fn transmit_part(
        &self,
        authorization: &PartAuthorization,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ContributeError> {
        // Authorized URLs carry their own credentials.
        let response = self
            .client
            .put(authorization.url.as_str())
            .header(http::header::CONTENT_TYPE, content_type)
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ContributeError::FailedPartTransmission(
                authorization.part_number,
                response.status().to_string(),
            ));
        }

        response
            .headers()
            .get(http::header::ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ContributeError::FailedPartTransmission(authorization.part_number, "missing ETag header".to_string())
            })
    }

    async fn finalize_transfer(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ContributeError> {
        let path = "/v1/storage/multipart/complete";
        let request = self.client.post(self.endpoint(path)?).json(&CompleteUploadRequest {
            upload_id,
            bucket,
            key,
            parts,
        });

        let response = self.send(request, path).await?;
        if !response.status().is_success() {
            return Err(ContributeError::FailedTransferFinalize(
                upload_id.to_string(),
                response.status().to_string(),
            ));
        }
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), ContributeError> {
        let path = "/v1/storage/download-url";
        let request = self
            .client
            .post(self.endpoint(path)?)
            .json(&ObjectLocation { bucket, key });

        let response = self.send(request, path).await?;
        if !response.status().is_success() {
            error!("Failed to obtain a download URL for {} ({})", key, response.status());
            return Err(ContributeError::FailedDownload(key.to_string()));
        }
        let download = serde_json::from_slice::<DownloadUrlResponse>(&response.bytes().await?)?;

        let mut response = self.client.get(download.url.as_str()).send().await?;
        if !response.status().is_success() {
            error!("Failed to download {} ({})", key, response.status());
            return Err(ContributeError::FailedDownload(key.to_string()));
        }

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        info!("Downloaded {} ({} bytes) to {}", key, written, local_path.display());
        Ok(())
    }
}

#[async_trait]
impl CheckpointAuthority for CoordinatorClient {
    async fn get_participant_checkpoint(
        &self,
        participant: &ParticipantKey,
    ) -> Result<ParticipantCheckpoint, ContributeError> {
        let path = Self::participant_path(participant, "checkpoint");
        let response = self.send(self.client.get(self.endpoint(&path)?), &path).await?;
        if !response.status().is_success() {
            error!("Failed to fetch the checkpoint of {} ({})", participant, response.status());
            return Err(ContributeError::FailedRequest(
                path,
                self.coordinator_api_url.to_string(),
            ));
        }

        let checkpoint = serde_json::from_slice::<ParticipantCheckpoint>(&response.bytes().await?)?;
        debug!("Decoded checkpoint: {:?}", checkpoint);
        Ok(checkpoint)
    }

    async fn set_participant_step(
        &self,
        participant: &ParticipantKey,
        step: ContributionStep,
    ) -> Result<(), ContributeError> {
        self.update_checkpoint(participant, "step", &StepUpdate { step }).await
    }

    async fn set_temp_upload_session(
        &self,
        participant: &ParticipantKey,
        session: &UploadSession,
    ) -> Result<(), ContributeError> {
        self.update_checkpoint(participant, "temp-upload", session).await
    }

    async fn add_uploaded_part(&self, participant: &ParticipantKey, part: &UploadedPart) -> Result<(), ContributeError> {
        self.update_checkpoint(participant, "temp-upload/parts", part).await
    }

    async fn store_contribution_record(
        &self,
        participant: &ParticipantKey,
        record: &ContributionRecord,
    ) -> Result<(), ContributeError> {
        self.update_checkpoint(participant, "contributions", record).await
    }

    async fn next_retry_time(&self, participant: &ParticipantKey) -> Result<Option<u64>, ContributeError> {
        let path = Self::participant_path(participant, "retry");
        let response = self.send(self.client.get(self.endpoint(&path)?), &path).await?;
        if !response.status().is_success() {
            return Err(ContributeError::FailedRequest(
                path,
                self.coordinator_api_url.to_string(),
            ));
        }

        let retry = serde_json::from_slice::<RetryResponse>(&response.bytes().await?)?;
        Ok(retry.retry_at)
    }
}

#[async_trait]
impl VerificationService for CoordinatorClient {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult, ContributeError> {
        let path = "/v1/verify";
        info!("Requesting verification of circuit {}", request.circuit_id);

        let response = self
            .send(self.client.post(self.endpoint(path)?).json(request), path)
            .await?;
        if !response.status().is_success() {
            error!("Verification request failed ({})", response.status());
            return Err(ContributeError::FailedVerification(response.status().to_string()));
        }

        Ok(serde_json::from_slice::<VerificationResult>(&response.bytes().await?)?)
    }
}

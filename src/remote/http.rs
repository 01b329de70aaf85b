//! HTTP adapter for the system of record
//!
//! Endpoints, relative to `base_url`:
//!
//! - `PATCH /api/results/{id}`
//! - `PATCH /api/checklists/{id}`
//! - `GET   /api/projects/{id}/bundle`
//! - `PUT   /storage/{bucket}/{path}`
//! - `GET   /health`

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::{
    Ack, ChecklistApi, ObjectStorage, ProjectBundle, ReachabilityProbe, ReadApi, ResultApi,
    ResultUpdate, UploadedObject,
};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::sync::mutation::ChecklistPatch;

/// Header carrying the mutation's idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a non-success response to the error taxonomy the queue understands
pub fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };
    match status.as_u16() {
        404 | 410 => RemoteError::NotFound(message),
        409 | 412 => RemoteError::Conflict(message),
        408 | 429 => RemoteError::Server { status: status.as_u16(), message },
        s if s >= 500 => RemoteError::Server { status: s, message },
        _ => RemoteError::Validation(message),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// reqwest-backed implementation of every remote role
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    bucket: String,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            bucket: config.bucket.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Public URL an uploaded object is served from
    pub fn public_url(&self, path: &str) -> String {
        self.url(&format!("/storage/public/{}/{}", self.bucket, path))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key).header("apikey", key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn json_or_default<T>(response: Response) -> Result<T, RemoteError>
    where
        T: DeserializeOwned + Default,
    {
        let body = response.bytes().await.map_err(transport_error)?;
        if body.is_empty() {
            return Ok(T::default());
        }
        // An unreadable success body still means the write landed
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }
}

#[async_trait]
impl ResultApi for HttpRemote {
    async fn update_result(
        &self,
        result_id: &str,
        update: &ResultUpdate,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError> {
        debug!(result = %result_id, key = %idempotency_key, "PATCH result");
        let request = self
            .client
            .patch(self.url(&format!("/api/results/{}", result_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(update);
        let response = self.send(request).await?;
        Self::json_or_default(response).await
    }
}

#[async_trait]
impl ChecklistApi for HttpRemote {
    async fn update_checklist(
        &self,
        checklist_id: &str,
        patch: &ChecklistPatch,
        idempotency_key: &str,
    ) -> Result<Ack, RemoteError> {
        debug!(checklist = %checklist_id, key = %idempotency_key, "PATCH checklist");
        let request = self
            .client
            .patch(self.url(&format!("/api/checklists/{}", checklist_id)))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(patch);
        let response = self.send(request).await?;
        Self::json_or_default(response).await
    }
}

#[derive(Default, serde::Deserialize)]
struct UploadResponse {
    #[serde(default)]
    public_url: Option<String>,
}

#[async_trait]
impl ObjectStorage for HttpRemote {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadedObject, RemoteError> {
        debug!(path = %path, size = bytes.len(), "PUT evidence object");
        let request = self
            .client
            .put(self.url(&format!("/storage/{}/{}", self.bucket, path)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            // Re-uploading after a lost ack overwrites the same object
            .header("x-upsert", "true")
            .body(bytes.to_vec());
        let response = self.send(request).await?;
        let parsed: UploadResponse = Self::json_or_default(response).await?;
        Ok(UploadedObject {
            public_url: parsed.public_url.unwrap_or_else(|| self.public_url(path)),
        })
    }
}

#[async_trait]
impl ReadApi for HttpRemote {
    async fn get_project_bundle(&self, project_id: &str) -> Result<ProjectBundle, RemoteError> {
        let request = self
            .client
            .get(self.url(&format!("/api/projects/{}/bundle", project_id)));
        let response = self.send(request).await?;
        response
            .json::<ProjectBundle>()
            .await
            .map_err(|e| RemoteError::Validation(format!("Malformed project bundle: {}", e)))
    }
}

#[async_trait]
impl ReachabilityProbe for HttpRemote {
    async fn probe(&self) -> bool {
        let request = self.client.get(self.url("/health")).timeout(PROBE_TIMEOUT);
        match self.authorize(request).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }
}

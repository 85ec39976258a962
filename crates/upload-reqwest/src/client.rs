//! Reqwest-backed implementation of the upload API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG};
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use rusty_filestore_upload::{
    CompleteResponse, PartSpec, PartTarget, ServiceError, StartResponse, StoredChunk,
    UploadService,
};

use crate::error::HttpError;

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const START_PATH: &str = "/multipart/start";
const UPLOAD_PATH: &str = "/multipart/upload";
const COMMIT_PATH: &str = "/multipart/commit";
const COMPLETE_PATH: &str = "/multipart/complete";

/// [`UploadService`] implementation over HTTP.
///
/// API calls are form-encoded POSTs against the upload endpoint; chunk
/// bodies go directly to the pre-signed storage destination with the
/// signing headers the server issued.
pub struct ReqwestUploadService {
    http: HttpClient,
    base_url: String,
}

impl ReqwestUploadService {
    /// Create a service against `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, HttpError> {
        let http: HttpClient = HttpClient::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self::from_client(http, base_url))
    }

    /// Create a service from a pre-configured client (for testing or
    /// custom proxy/TLS setups).
    pub fn from_client(http: HttpClient, base_url: impl Into<String>) -> Self {
        let mut base_url: String = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    async fn post_form(
        &self,
        api_path: &str,
        form: &HashMap<String, String>,
    ) -> Result<Response, ServiceError> {
        debug!(api_path, "api call");
        self.http
            .post(format!("{}{}", self.base_url, api_path))
            .form(form)
            .send()
            .await
            .map_err(ServiceError::transport)
    }
}

/// Reject non-success statuses, carrying the response body as the message.
async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status: StatusCode = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code: u16 = status.as_u16();
    let message: String = response.text().await.unwrap_or_default();
    Err(ServiceError::Status { code, message })
}

/// Decode a JSON body. A truncated or garbled body never carried a usable
/// status, so it counts as a transport failure.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    response.json::<T>().await.map_err(ServiceError::transport)
}

#[async_trait]
impl UploadService for ReqwestUploadService {
    async fn start_upload(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<StartResponse, ServiceError> {
        let response: Response = self.post_form(START_PATH, params).await?;
        decode(check_status(response).await?).await
    }

    async fn upload_part(
        &self,
        params: &HashMap<String, String>,
        part: &PartSpec,
    ) -> Result<PartTarget, ServiceError> {
        let mut form: HashMap<String, String> = params.clone();
        form.insert("part".to_string(), part.part_number.to_string());
        form.insert("size".to_string(), part.size.to_string());
        form.insert("md5".to_string(), part.md5.clone());
        if let Some(offset) = part.offset {
            form.insert("offset".to_string(), offset.to_string());
        }

        let response: Response = self.post_form(UPLOAD_PATH, &form).await?;
        decode(check_status(response).await?).await
    }

    async fn put_to_storage(
        &self,
        target: &PartTarget,
        body: Bytes,
    ) -> Result<StoredChunk, ServiceError> {
        let mut headers: HeaderMap = HeaderMap::new();
        for (name, value) in &target.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                ServiceError::transport(format!("invalid signing header {name}: {err}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|err| {
                ServiceError::transport(format!("invalid signing header value for {name}: {err}"))
            })?;
            headers.insert(header_name, header_value);
        }

        let response: Response = self
            .http
            .put(&target.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(ServiceError::transport)?;
        let response: Response = check_status(response).await?;

        let etag: Option<String> = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(StoredChunk { etag })
    }

    async fn commit_part(
        &self,
        params: &HashMap<String, String>,
        part_number: u64,
    ) -> Result<(), ServiceError> {
        let mut form: HashMap<String, String> = params.clone();
        form.insert("part".to_string(), part_number.to_string());

        let response: Response = self.post_form(COMMIT_PATH, &form).await?;
        check_status(response).await?;
        Ok(())
    }

    async fn complete_upload(
        &self,
        params: &HashMap<String, String>,
        parts: Option<&str>,
    ) -> Result<CompleteResponse, ServiceError> {
        let mut form: HashMap<String, String> = params.clone();
        if let Some(parts) = parts {
            form.insert("parts".to_string(), parts.to_string());
        }

        let response: Response = self.post_form(COMPLETE_PATH, &form).await?;
        // The backend answers 202 while intelligent-mode parts are still
        // being assembled; surface it as a retryable status so the engine
        // polls under its server budget.
        if response.status() == StatusCode::ACCEPTED {
            return Err(ServiceError::Status {
                code: StatusCode::ACCEPTED.as_u16(),
                message: "upload still processing".to_string(),
            });
        }
        decode(check_status(response).await?).await
    }
}

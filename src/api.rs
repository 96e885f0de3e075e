use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::recording::RecordingArtifact;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const UPLOAD_VIDEO_PATH: &str = "/v1/room-member/upload-video";

/// Destination of a finished room recording.
#[async_trait]
pub trait SessionUploader: Send + Sync {
    async fn upload(&self, room_id: &str, artifact: RecordingArtifact) -> Result<()>;
}

/// Shared HTTP client for the REST backend.
///
/// Constructed once at start-up with [`ApiClient::init`] and passed around by
/// reference. The bearer token is the only mutable state: it can be replaced
/// with [`ApiClient::refresh_token`] and cleared with [`ApiClient::teardown`].
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn init(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        debug!(%base_url, authenticated = token.is_some(), "api client initialized");
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(token),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn refresh_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn teardown(&self) {
        self.token.write().take();
        debug!("api client credentials cleared");
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Posts one recorded session; returns the stored file URL from the body.
    pub async fn upload_video(&self, room_id: &str, artifact: RecordingArtifact) -> Result<String> {
        let bytes = artifact.data.len();
        let mut form = Form::new()
            .text("roomId", room_id.to_owned())
            .text("videoStart", artifact.video_start());
        if let Some(fps) = artifact.frame_rate {
            form = form.text("videoFps", fps.to_string());
        }
        let file = Part::bytes(artifact.data.to_vec())
            .file_name(artifact.file_name)
            .mime_str(artifact.content_type)?;
        let form = form.part("file", file);

        let request = self
            .http
            .post(self.url(UPLOAD_VIDEO_PATH))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form);
        let response = self.authorize(request).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::UploadRejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(room_id, bytes, "recording uploaded");
        Ok(body)
    }
}

#[async_trait]
impl SessionUploader for ApiClient {
    async fn upload(&self, room_id: &str, artifact: RecordingArtifact) -> Result<()> {
        self.upload_video(room_id, artifact).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = ApiClient::init("https://api.example.com/", None).unwrap();
        assert_eq!(
            client.url(UPLOAD_VIDEO_PATH),
            "https://api.example.com/v1/room-member/upload-video"
        );
    }

    #[test]
    fn token_lifecycle() {
        let client = ApiClient::init("http://localhost", None).unwrap();
        assert!(!client.is_authenticated());
        client.refresh_token("t1");
        assert!(client.is_authenticated());
        client.teardown();
        assert!(!client.is_authenticated());
    }

    #[test]
    fn bearer_header_only_with_a_token() {
        let client = ApiClient::init("http://localhost", Some("secret".into())).unwrap();
        let request = client
            .authorize(client.http.get(client.url("/v1/room")))
            .build()
            .unwrap();
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer secret"
        );

        client.teardown();
        let request = client
            .authorize(client.http.get(client.url("/v1/room")))
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
    }
}

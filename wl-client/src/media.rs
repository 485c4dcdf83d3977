//! Media collaborator: blob upload and streaming download.
//!
//! Media never travels over the chat connection. Outbound files are uploaded
//! to the media endpoint first and referenced by URL in the media frame;
//! inbound media is downloaded by URL and streamed to the media directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use wl_auth::SessionManager;
use wl_core::constants;
use wl_core::error::{WlError, WlResult};

/// Result of a successful upload, ready to embed in a media frame.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub url: String,
    pub mime_type: String,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// HTTP client for the media endpoint.
pub struct MediaClient {
    http: Client,
    session: Arc<SessionManager>,
    media_dir: PathBuf,
    max_retries: u32,
}

impl MediaClient {
    /// Create a media client storing downloads under `media_dir`.
    pub fn new(
        session: Arc<SessionManager>,
        media_dir: PathBuf,
        user_agent: &str,
        request_timeout: Duration,
    ) -> WlResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| WlError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            session,
            media_dir,
            max_retries: constants::RETRY_MAX,
        })
    }

    /// Upload the file at `path` and return its hosted location.
    ///
    /// Transient failures are retried with the same backoff discipline as
    /// login; server rejections surface immediately as media errors.
    pub async fn upload(&self, path: &Path) -> WlResult<MediaUpload> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WlError::BadParam(format!("invalid file path: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| WlError::Media(format!("cannot read {}: {e}", path.display())))?;
        let file_size = bytes.len() as u64;
        let mime_type = mime_from_extension(path).to_string();

        let server = self.session.chat_server().await;
        let url = format!("https://{server}/{}/media", constants::API_VERSION);

        let mut attempt: u32 = 0;
        let response = loop {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(file_name.clone())
                .mime_str(&mime_type)
                .map_err(|e| WlError::BadParam(format!("invalid mime type: {e}")))?;
            let form = reqwest::multipart::Form::new()
                .text("name", file_name.clone())
                .part("media", part);

            debug!("uploading {file_name} ({file_size} bytes) to {url}");
            let result = self
                .request_with_session(self.http.post(&url))
                .await?
                .multipart(form)
                .send()
                .await;

            match result {
                Ok(response) => break response,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_secs(2u64 << (attempt - 1).min(8));
                    warn!(
                        "upload attempt {attempt}/{} failed ({e}), retrying in {:.0?}",
                        self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(classify(e)),
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(WlError::Media(format!("upload rejected with {status}")));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| WlError::Media(format!("malformed upload response: {e}")))?;
        if body.status != "ok" {
            let reason = body.reason.unwrap_or_else(|| "unknown error".into());
            return Err(WlError::Media(format!("upload failed: {reason}")));
        }
        let hosted_url = body
            .url
            .ok_or_else(|| WlError::Media("upload response carries no url".into()))?;

        info!("uploaded {file_name} -> {hosted_url}");
        Ok(MediaUpload {
            url: hosted_url,
            mime_type,
            file_name,
            file_size,
        })
    }

    /// Download `url` into the media directory, streaming to disk.
    ///
    /// The target file name defaults to the last URL path segment.
    pub async fn download(&self, url: &str, file_name: Option<&str>) -> WlResult<PathBuf> {
        let name = match file_name {
            Some(name) => name.to_string(),
            None => file_name_from_url(url),
        };

        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|e| WlError::Media(format!("cannot create media dir: {e}")))?;
        let target = self.media_dir.join(&name);

        let response = self
            .request_with_session(self.http.get(url))
            .await?
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(WlError::Media(format!("download rejected with {status}")));
        }

        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| WlError::Media(format!("cannot create {}: {e}", target.display())))?;
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            total += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| WlError::Media(format!("write failed: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| WlError::Media(format!("flush failed: {e}")))?;

        info!("downloaded {url} -> {} ({total} bytes)", target.display());
        Ok(target)
    }

    /// Attach the current session id, if any, to an outgoing request.
    async fn request_with_session(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> WlResult<reqwest::RequestBuilder> {
        Ok(match self.session.session().await {
            Some(session) => builder.header("X-Waveline-Session", session.session_id),
            None => builder,
        })
    }
}

fn classify(e: reqwest::Error) -> WlError {
    if e.is_timeout() {
        WlError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        WlError::Connection(e.to_string())
    } else {
        WlError::Media(e.to_string())
    }
}

/// Derive a local file name from a download URL.
fn file_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.split('?').next().unwrap_or(segment).to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("media-{}", uuid::Uuid::new_v4().simple()))
}

/// Best-effort mime type from the file extension.
pub fn mime_from_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("pdf") => "application/pdf",
        Some("vcf") => "text/vcard",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Media type code for a mime type, carried inside media frames.
pub fn media_type_code(mime_type: &str) -> u32 {
    use wl_core::constants::media_types;
    if mime_type.starts_with("image/") {
        media_types::IMAGE
    } else if mime_type.starts_with("video/") {
        media_types::VIDEO
    } else if mime_type.starts_with("audio/") {
        media_types::AUDIO
    } else {
        media_types::DOCUMENT
    }
}

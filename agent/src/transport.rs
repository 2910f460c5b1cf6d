/// Delivery of single changes to the collector.
///
/// Two realizations exist: an HTTP POST per change to the admin server, and a
/// framed byte stream written to the virtio serial port (see
/// [`crate::protocol`]). The queue only cares whether a send succeeded.
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{DeliveryConfig, TransportKind};
use crate::event::ChangeEvent;
use crate::protocol;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one change. `Ok` means the collector side accepted it.
    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError>;
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
    submit_path: String,
}

impl HttpTransport {
    pub fn new(server_url: &str, submit_path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            submit_path: normalize_submit_path(submit_path),
        }
    }

    /// Full submit URL for `namespace`, e.g.
    /// `http://host:8181/changes/submit/org.gnome.gsettings`.
    pub fn submit_url(&self, namespace: &str) -> String {
        format!("{}{}{}", self.server_url, self.submit_path, namespace)
    }
}

/// Ensures the path starts and ends with `/`.
fn normalize_submit_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let url = self.submit_url(event.namespace().as_str());
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(event.payload().to_string())
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            // The server rejects namespaces it does not collect; retrying
            // would never succeed.
            403 => {
                tracing::error!("server rejected change namespace {}", event.namespace());
                Ok(())
            }
            _ if status.is_success() => {
                tracing::debug!("change submitted to {url}");
                Ok(())
            }
            code => Err(TransportError::Status(code)),
        }
    }
}

// ── Serial port ───────────────────────────────────────────────────────────────

/// Writes framed changes to a character device. The device is opened lazily
/// and reopened after any write error, so a missing port is retried on every
/// flush.
pub struct PortTransport {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl PortTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<tokio::fs::File, TransportError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(false)
            .open(&self.path)
            .await?;
        file.write_all(protocol::header().as_bytes()).await?;
        tracing::info!("using {} for submitting changes", self.path.display());
        Ok(file)
    }
}

#[async_trait]
impl Transport for PortTransport {
    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let frame = protocol::encode(event)?;
        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await?,
        };

        // On error the handle is dropped so the next flush reopens the port.
        for chunk in frame.chunks(protocol::CHUNK_SIZE) {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        *guard = Some(file);
        Ok(())
    }
}

/// Builds the transport selected in the config.
pub fn from_config(config: &DeliveryConfig) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Http => Box::new(HttpTransport::new(&config.server_url, &config.submit_path)),
        TransportKind::Port => Box::new(PortTransport::new(&config.device_path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Namespace;
    use crate::protocol::StreamDecoder;

    // ── HTTP URL building ─────────────────────────────────────────────────────

    #[test]
    fn submit_url_joins_server_path_and_namespace() {
        let t = HttpTransport::new("http://localhost:8181/", "/changes/submit/");
        assert_eq!(
            t.submit_url("org.gnome.gsettings"),
            "http://localhost:8181/changes/submit/org.gnome.gsettings"
        );
    }

    #[test]
    fn submit_path_is_normalized() {
        assert_eq!(normalize_submit_path("changes/submit"), "/changes/submit/");
        assert_eq!(normalize_submit_path("/changes/submit/"), "/changes/submit/");
        assert_eq!(normalize_submit_path(""), "/");
    }

    // ── Port ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn port_writes_header_once_then_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port");
        std::fs::write(&path, b"").unwrap();

        let port = PortTransport::new(&path);
        port.send(&ChangeEvent::new(Namespace::Firefox, "one")).await.unwrap();
        port.send(&ChangeEvent::new(Namespace::Firefox, "two")).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(text.matches(protocol::HEADER_PREFIX).count(), 1);

        let mut dec = StreamDecoder::new();
        let msgs = dec.feed(&bytes);
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn port_missing_device_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let port = PortTransport::new(dir.path().join("absent"));
        let result = port.send(&ChangeEvent::new(Namespace::Firefox, "x")).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use crate::core::DownloadError;
use crate::storage::download::{RemoteBlob, SnapshotSource};

/// 源端 manifest：指向 blob，并给出 sha256 与 schema 版本
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotManifest {
    url: String,
    sha256: String,
    schema_version: u32,
    #[serde(default)]
    size: Option<u64>,
}

/// 通过 HTTP 拉取快照：先取 manifest（JSON），再流式拉 blob。
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    manifest_url: reqwest::Url,
    request_timeout: Duration,
}

impl HttpSnapshotSource {
    pub fn new(manifest_url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("catalog-mirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            manifest_url: reqwest::Url::parse(manifest_url)?,
            request_timeout: connect_timeout,
        })
    }

    fn map_err(&self, e: reqwest::Error) -> DownloadError {
        if e.is_timeout() {
            DownloadError::timeout(self.request_timeout)
        } else {
            DownloadError::Network(e.to_string())
        }
    }

    async fn fetch_manifest(&self) -> Result<SnapshotManifest, DownloadError> {
        let resp = self
            .client
            .get(self.manifest_url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if !resp.status().is_success() {
            return Err(DownloadError::Network(format!(
                "manifest request returned {}",
                resp.status()
            )));
        }
        resp.json::<SnapshotManifest>()
            .await
            .map_err(|e| DownloadError::Network(format!("bad manifest: {}", e)))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        self.manifest_url.as_str()
    }

    async fn open(&self) -> Result<RemoteBlob, DownloadError> {
        let manifest = self.fetch_manifest().await?;
        // manifest 里的 url 可以是相对路径
        let blob_url = self
            .manifest_url
            .join(&manifest.url)
            .map_err(|e| DownloadError::Network(format!("bad blob url {}: {}", manifest.url, e)))?;

        let resp = self
            .client
            .get(blob_url.clone())
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if !resp.status().is_success() {
            return Err(DownloadError::Network(format!(
                "blob request {} returned {}",
                blob_url,
                resp.status()
            )));
        }

        let size_hint = manifest.size.or_else(|| resp.content_length());
        let body = resp
            .bytes_stream()
            .map(|r| {
                r.map(|b| b.to_vec())
                    .map_err(|e| DownloadError::Network(e.to_string()))
            })
            .boxed();

        Ok(RemoteBlob {
            checksum: manifest.sha256,
            schema_version: manifest.schema_version,
            size_hint,
            body,
        })
    }
}

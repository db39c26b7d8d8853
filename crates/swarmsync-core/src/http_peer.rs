//! HTTP peer - serves a file version from a plain HTTP server
//!
//! Part support is detected from `Accept-Ranges: bytes`. Parts records are
//! looked up next to the file as `<url>.parts?block=<n>` (JSON).

use crate::error::{Result, SyncError};
use crate::peer::{ByteStream, Peer};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use swarmsync_types::{FileVersion, PartsRecord, PeerId, TransferMessage};
use tracing::{debug, info};
use url::Url;

/// What a HEAD request revealed about a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

pub struct HttpPeer {
    id: PeerId,
    client: Client,
    /// Exact URL of the file
    url: Url,
    part_requests: AtomicBool,
    connected: AtomicBool,
    lan: bool,
    bandwidth: AtomicU64,
}

impl HttpPeer {
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("SwarmSync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(url, client))
    }

    pub fn with_client(url: Url, client: Client) -> Self {
        let lan = url
            .host_str()
            .map(|h| h == "localhost" || h.starts_with("127.") || h.starts_with("192.168."))
            .unwrap_or(false);
        Self {
            id: PeerId::new(url.as_str()),
            client,
            url,
            part_requests: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            lan,
            bandwidth: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// HEAD the file, record whether ranges are accepted
    pub async fn probe(&self) -> Result<ProbeInfo> {
        info!("Probing {}", self.url);
        let response = self.client.head(self.url.as_str()).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::ServerError {
                status: response.status().as_u16(),
                message: format!("HEAD {} failed", self.url),
            });
        }

        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s == "bytes")
            .unwrap_or(false);

        self.part_requests.store(accepts_ranges, Ordering::Relaxed);
        Ok(ProbeInfo {
            size,
            accepts_ranges,
        })
    }

    fn parts_url(&self, block_size: u64) -> Result<Url> {
        let mut url = Url::parse(&format!("{}.parts", self.url.as_str().trim_end_matches('/')))
            .map_err(|e| SyncError::InvalidOperation(e.to_string()))?;
        url.set_query(Some(&format!("block={}", block_size)));
        Ok(url)
    }

    async fn fetch_range(&self, version: &FileVersion, offset: u64, length: u64) -> Result<ByteStream> {
        let whole = offset == 0 && length >= version.size;
        let mut request = self.client.get(self.url.as_str());
        if !whole {
            let end = offset + length.saturating_sub(1);
            let range = format!("bytes={}-{}", offset, end);
            debug!("Requesting {} from {}", range, self.url);
            request = request.header(reqwest::header::RANGE, range);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_connect() {
                    self.connected.store(false, Ordering::Relaxed);
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        let acceptable = status == StatusCode::PARTIAL_CONTENT || (whole && status == StatusCode::OK);
        if !acceptable {
            if status == StatusCode::NOT_FOUND {
                return Err(SyncError::FileNotFound(version.path.clone()));
            }
            return Err(SyncError::ServerError {
                status: status.as_u16(),
                message: format!("unexpected answer to range {}+{}", offset, length),
            });
        }

        Ok(response.bytes_stream().map_err(SyncError::from).boxed())
    }

    async fn fetch_parts_record(&self, block_size: u64) -> Result<Option<PartsRecord>> {
        let response = self.client.get(self.parts_url(block_size)?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json::<PartsRecord>().await?)),
            s => Err(SyncError::ServerError {
                status: s.as_u16(),
                message: "parts record unavailable".into(),
            }),
        }
    }

    pub fn set_bandwidth_estimate(&self, bytes_per_second: u64) {
        self.bandwidth.store(bytes_per_second, Ordering::Relaxed);
    }
}

impl Peer for HttpPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn supports_part_requests(&self) -> bool {
        self.part_requests.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn is_lan(&self) -> bool {
        self.lan
    }

    fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    fn request_range<'a>(
        &'a self,
        version: &'a FileVersion,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        self.fetch_range(version, offset, length).boxed()
    }

    fn request_parts_record<'a>(
        &'a self,
        _version: &'a FileVersion,
        block_size: u64,
    ) -> BoxFuture<'a, Result<Option<PartsRecord>>> {
        self.fetch_parts_record(block_size).boxed()
    }

    fn send(&self, message: TransferMessage) -> BoxFuture<'_, Result<()>> {
        // Plain HTTP has no control channel
        debug!("Dropping control message for {}: {:?}", self.id, message);
        async { Ok(()) }.boxed()
    }
}

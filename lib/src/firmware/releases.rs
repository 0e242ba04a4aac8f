//! Released-firmware metadata: query a GitHub-shaped release endpoint, pick
//! the highest version, and download assets. Responses are cached per
//! endpoint so polling UIs do not hammer the API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::version::FirmwareVersion;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("rate limited by the release endpoint until {reset}")]
    RateLimited { reset: DateTime<Utc> },
    #[error("release endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("downloaded {written} bytes but expected {expected}")]
    SizeMismatch { written: u64, expected: u64 },
    #[error("no file name in download url {0:?}")]
    InvalidUrl(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw release element as served by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAssetRecord>,
    #[serde(default)]
    pub zipball_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAssetRecord {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// The selected newest release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    pub version: FirmwareVersion,
    pub is_prerelease: bool,
    pub body: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub asset: Option<ReleaseAsset>,
    pub zipball_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseAsset {
    pub download_url: String,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseChannel {
    /// Main (PIC32) firmware releases.
    Firmware,
    /// WiFi radio module firmware releases.
    WifiModule,
}

#[derive(Debug, Clone)]
pub struct ReleaseClientOptions {
    pub firmware_url: String,
    pub wifi_module_url: String,
    pub cache_ttl: Duration,
    pub user_agent: String,
}

impl Default for ReleaseClientOptions {
    fn default() -> Self {
        ReleaseClientOptions {
            firmware_url: "https://api.github.com/repos/daqifi/daqifi-nyquist-firmware/releases"
                .to_string(),
            wifi_module_url:
                "https://api.github.com/repos/daqifi/daqifi-nyquist-wifi-firmware/releases"
                    .to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
            user_agent: format!("daqifi/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct CacheSlot {
    fetched_at: Instant,
    releases: Vec<ReleaseRecord>,
}

pub struct ReleaseClient {
    client: reqwest::Client,
    options: ReleaseClientOptions,
    cache: Mutex<HashMap<ReleaseChannel, CacheSlot>>,
}

impl ReleaseClient {
    pub fn new(options: ReleaseClientOptions) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .build()?;
        Ok(ReleaseClient {
            client,
            options,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, channel: ReleaseChannel) -> &str {
        match channel {
            ReleaseChannel::Firmware => &self.options.firmware_url,
            ReleaseChannel::WifiModule => &self.options.wifi_module_url,
        }
    }

    /// Newest released version on `channel`, with the first asset whose file
    /// name ends in `asset_extension`. `None` when no release qualifies.
    pub async fn latest(
        &self,
        channel: ReleaseChannel,
        include_prerelease: bool,
        asset_extension: &str,
    ) -> Result<Option<ReleaseInfo>, ReleaseError> {
        let releases = self.fetch(channel).await?;
        Ok(pick_latest(&releases, include_prerelease, asset_extension))
    }

    async fn fetch(&self, channel: ReleaseChannel) -> Result<Vec<ReleaseRecord>, ReleaseError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(slot) = cache.get(&channel) {
                if slot.fetched_at.elapsed() < self.options.cache_ttl {
                    debug!("release cache hit for {channel:?}");
                    return Ok(slot.releases.clone());
                }
            }
        }

        let url = self.endpoint(channel);
        info!("fetching release list from {url}");
        let response = self.client.get(url).send().await?;
        check_status(&response)?;
        let releases: Vec<ReleaseRecord> = response.json().await?;

        self.cache.lock().unwrap().insert(
            channel,
            CacheSlot {
                fetched_at: Instant::now(),
                releases: releases.clone(),
            },
        );
        Ok(releases)
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Stream `url` into `dir`, named after the url's last path segment.
    /// When `expected_size` is given, a byte-count mismatch is an error.
    pub async fn download_to(
        &self,
        dir: &Path,
        url: &str,
        expected_size: Option<u64>,
    ) -> Result<PathBuf, ReleaseError> {
        let file_name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ReleaseError::InvalidUrl(url.to_string()))?;
        let path = dir.join(file_name);

        let response = self.client.get(url).send().await?;
        check_status(&response)?;

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected_size {
            if written != expected {
                return Err(ReleaseError::SizeMismatch { written, expected });
            }
        }
        info!("downloaded {written} bytes to {}", path.display());
        Ok(path)
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), ReleaseError> {
    let status = response.status();
    if status == reqwest::StatusCode::FORBIDDEN {
        if let Some(reset) = rate_limit_reset(response) {
            return Err(ReleaseError::RateLimited { reset });
        }
    }
    if !status.is_success() {
        return Err(ReleaseError::Status(status));
    }
    Ok(())
}

fn rate_limit_reset(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let header = response.headers().get("x-ratelimit-reset")?;
    let epoch: i64 = header.to_str().ok()?.trim().parse().ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

/// Selection over an already-fetched list: skip drafts, optionally skip
/// prereleases, parse tags as versions, keep the maximum.
fn pick_latest(
    releases: &[ReleaseRecord],
    include_prerelease: bool,
    asset_extension: &str,
) -> Option<ReleaseInfo> {
    let mut best: Option<(FirmwareVersion, &ReleaseRecord)> = None;
    for release in releases {
        if release.draft {
            continue;
        }
        if release.prerelease && !include_prerelease {
            continue;
        }
        let Some(version) = FirmwareVersion::parse(&release.tag_name) else {
            debug!("ignoring release with unparseable tag {:?}", release.tag_name);
            continue;
        };
        if best.as_ref().is_none_or(|(max, _)| version > *max) {
            best = Some((version, release));
        }
    }
    best.map(|(version, release)| ReleaseInfo {
        tag_name: release.tag_name.clone(),
        version,
        is_prerelease: release.prerelease,
        body: release.body.clone(),
        published_at: release.published_at,
        asset: release
            .assets
            .iter()
            .find(|asset| asset.name.ends_with(asset_extension))
            .map(|asset| ReleaseAsset {
                download_url: asset.browser_download_url.clone(),
                file_name: asset.name.clone(),
                size: asset.size,
            }),
        zipball_url: release.zipball_url.clone(),
    })
}

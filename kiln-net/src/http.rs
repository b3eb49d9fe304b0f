// kiln-net/src/http.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_aio::checksum::verify_checksum;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use tempfile::Builder as TempFileBuilder;
use tracing::{debug, error, warn};
use url::Url;

use crate::validation::{url_filename, validate_url};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln build orchestrator (Rust)";
/// Checksum characters kept in cache file names.
const CACHE_KEY_SHA_LEN: usize = 12;

/// An artifact to materialize locally: source archive, bottle or patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub package: String,
    pub url: String,
    pub sha256: String,
    pub mirrors: Vec<String>,
}

impl FetchRequest {
    pub fn new(package: impl Into<String>, url: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            url: url.into(),
            sha256: sha256.into(),
            mirrors: Vec::new(),
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }
}

/// URL + expected checksum to a verified local path, or `IntegrityError`.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<PathBuf>;
}

/// Fetches into `<root>/kiln_cache`, reusing cached files whose checksum
/// still matches. `file://` URLs are verified in place.
pub struct CachingFetcher {
    cache_dir: PathBuf,
    client: Client,
}

impl CachingFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            cache_dir: config.cache_dir(),
            client: build_http_client()?,
        })
    }

    fn fetch_local(&self, request: &FetchRequest, url: &Url) -> Result<PathBuf> {
        let path = url.to_file_path().map_err(|_| {
            KilnError::ValidationError(format!("Invalid file URL '{}'", request.url))
        })?;
        if !path.is_file() {
            return Err(KilnError::DownloadError(
                request.package.clone(),
                request.url.clone(),
                "Local file not found".to_string(),
            ));
        }
        verify_checksum(&request.package, &path, &request.sha256)?;
        debug!("Using verified local file: {}", path.display());
        Ok(path)
    }

    fn cached_if_valid(&self, request: &FetchRequest, cache_path: &Path) -> Option<PathBuf> {
        if !cache_path.is_file() {
            debug!("File not found in cache.");
            return None;
        }
        match verify_checksum(&request.package, cache_path, &request.sha256) {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                Some(cache_path.to_path_buf())
            }
            Err(e) => {
                debug!(
                    "Cached file checksum mismatch ({}): {}. Redownloading.",
                    cache_path.display(),
                    e
                );
                if let Err(remove_err) = fs::remove_file(cache_path) {
                    debug!(
                        "Failed to remove corrupted cached file {}: {}",
                        cache_path.display(),
                        remove_err
                    );
                }
                None
            }
        }
    }

    fn download_and_verify(
        &self,
        request: &FetchRequest,
        url: &str,
        final_path: &Path,
    ) -> Result<PathBuf> {
        let mut response = self.client.get(url).send().map_err(|e| {
            debug!("HTTP request failed for {url}: {e}");
            KilnError::DownloadError(request.package.clone(), url.to_string(), e.to_string())
        })?;
        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);
        if !status.is_success() {
            let reason = match status {
                StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
                StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
                other => format!("HTTP error {other}"),
            };
            return Err(KilnError::DownloadError(
                request.package.clone(),
                url.to_string(),
                reason,
            ));
        }

        // Unique per download so concurrent fetches never share a partial file.
        let dir = final_path.parent().unwrap_or(&self.cache_dir);
        let mut temp_file = TempFileBuilder::new()
            .prefix(".kiln-")
            .suffix(".download")
            .tempfile_in(dir)?;
        debug!("Downloading {} to {}", url, temp_file.path().display());
        if let Err(e) = io::copy(&mut response, temp_file.as_file_mut()) {
            return Err(KilnError::DownloadError(
                request.package.clone(),
                url.to_string(),
                format!("Failed to read response body: {e}"),
            ));
        }

        verify_checksum(&request.package, temp_file.path(), &request.sha256)?;
        temp_file.persist(final_path).map_err(|e| e.error)?;
        debug!(
            "Moved verified file to final location: {}",
            final_path.display()
        );
        Ok(final_path.to_path_buf())
    }
}

/// Cache entry name: `<package>--<sha256 prefix>--<url filename>`. Two
/// packages (or two versions) whose URLs end in the same file name never
/// share an entry.
fn cache_file_name(request: &FetchRequest, url: &Url) -> String {
    let filename = url_filename(url).unwrap_or_else(|| "download".to_string());
    let sha: String = request
        .sha256
        .trim()
        .chars()
        .take(CACHE_KEY_SHA_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{}--{}--{}", request.package, sha, filename)
}

impl Fetcher for CachingFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<PathBuf> {
        debug!(
            "Preparing to fetch '{}' for '{}' (sha256 {})",
            request.url, request.package, request.sha256
        );
        if request.sha256.trim().is_empty() {
            return Err(KilnError::ValidationError(format!(
                "No checksum declared for {} ({})",
                request.package, request.url
            )));
        }
        let url = validate_url(&request.url)?;
        if url.scheme() == "file" {
            return self.fetch_local(request, &url);
        }

        let cache_path = self.cache_dir.join(cache_file_name(request, &url));
        if let Some(path) = self.cached_if_valid(request, &cache_path) {
            return Ok(path);
        }
        fs::create_dir_all(&self.cache_dir)?;

        let mut last_error: Option<KilnError> = None;
        for current_url in std::iter::once(&request.url).chain(request.mirrors.iter()) {
            validate_url(current_url)?;
            debug!("Attempting download from: {}", current_url);
            match self.download_and_verify(request, current_url, &cache_path) {
                Ok(path) => return Ok(path),
                // Wrong bytes are wrong everywhere; do not try mirrors.
                Err(e @ KilnError::IntegrityError { .. }) => {
                    error!("Checksum mismatch for {}: {}", current_url, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Download attempt failed from {}: {}", current_url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            KilnError::DownloadError(
                request.package.clone(),
                request.url.clone(),
                "All download attempts failed.".to_string(),
            )
        }))
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KilnError::from)
}

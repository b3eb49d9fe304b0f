// kiln-net/src/validation.rs
use kiln_common::error::{KilnError, Result};
use url::Url;

/// Parses `url_str`, accepting only `https` and local `file` URLs.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| {
        KilnError::ValidationError(format!("Failed to parse URL '{url_str}': {e}"))
    })?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        other => Err(KilnError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': Must be https or file, but got '{other}'"
        ))),
    }
}

/// Last path segment of `url`, used as the cache file name.
pub fn url_filename(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    DownloadError(String, String, String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Extraction Error: {0}")]
    ExtractError(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Generic Error: {0}")]
    Generic(String),

    #[error(
        "Integrity error for '{package}': checksum mismatch for {location} (expected {expected}, got {actual})"
    )]
    IntegrityError {
        package: String,
        location: String,
        expected: String,
        actual: String,
    },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Missing dependency '{dependency}' required by '{required_by}'")]
    MissingDependency {
        dependency: String,
        required_by: String,
    },

    #[error("Unknown option '{option}' for '{package}'")]
    UnknownOption { package: String, option: String },

    #[error("Incompatible options for '{package}' [{}]: {reason}", .options.join(", "))]
    IncompatibleOptions {
        package: String,
        options: Vec<String>,
        reason: String,
    },

    #[error("Patch '{patch}' failed to apply for '{package}': {reason}")]
    PatchFailed {
        package: String,
        patch: String,
        reason: String,
    },

    #[error("Build failed for '{package}' during `{step}` (exit status: {})", fmt_status(.status))]
    BuildFailed {
        package: String,
        step: String,
        status: Option<i32>,
        output: String,
    },

    #[error("Install conflict for '{package}': {} is owned by {}", .path.display(), fmt_owner(.owner))]
    InstallConflict {
        package: String,
        path: PathBuf,
        owner: Option<String>,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "terminated by signal".to_string(),
    }
}

fn fmt_owner(owner: &Option<String>) -> String {
    match owner {
        Some(name) => format!("'{name}'"),
        None => "no kiln package (unmanaged file)".to_string(),
    }
}

impl KilnError {
    /// The package an error originated from, when the error carries one.
    pub fn package(&self) -> Option<&str> {
        match self {
            KilnError::IntegrityError { package, .. }
            | KilnError::UnknownOption { package, .. }
            | KilnError::IncompatibleOptions { package, .. }
            | KilnError::PatchFailed { package, .. }
            | KilnError::BuildFailed { package, .. }
            | KilnError::InstallConflict { package, .. } => Some(package),
            KilnError::MissingDependency { required_by, .. } => Some(required_by),
            _ => None,
        }
    }

    /// Output captured from the external build backend, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            KilnError::BuildFailed { output, .. } if !output.trim().is_empty() => Some(output),
            _ => None,
        }
    }

    /// Errors that are detected while planning, before any build work starts.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            KilnError::CycleDetected { .. }
                | KilnError::MissingDependency { .. }
                | KilnError::UnknownOption { .. }
                | KilnError::IncompatibleOptions { .. }
        )
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

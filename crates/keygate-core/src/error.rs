//! Error types for key decoding, reference parsing and verification.

use std::path::PathBuf;
use std::time::Duration;

/// Failure to decode a single PEM block into a public key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The block is not a `PUBLIC KEY` block.
    #[error("block {index}: unexpected PEM label {label:?}, expected \"PUBLIC KEY\"")]
    UnexpectedLabel { index: usize, label: String },

    /// The block body is not valid base64.
    #[error("block {index}: invalid PEM body: {reason}")]
    Pem { index: usize, reason: String },

    /// The block body is not a valid SubjectPublicKeyInfo.
    #[error("block {index}: invalid SPKI public key: {reason}")]
    Spki { index: usize, reason: String },
}

impl DecodeError {
    /// Zero-based position of the failing block in the blob.
    pub fn index(&self) -> usize {
        match self {
            Self::UnexpectedLabel { index, .. } | Self::Pem { index, .. } | Self::Spki { index, .. } => {
                *index
            }
        }
    }
}

/// Key material errors. All of these abort a run.
#[derive(Debug, thiserror::Error)]
pub enum KeyMaterialError {
    /// No usable key could be decoded; wraps the first block failure.
    #[error("malformed key material: {source}")]
    MalformedKeyMaterial {
        #[source]
        source: DecodeError,
        /// Total number of blocks that failed.
        failed_blocks: usize,
    },

    /// The blob contained no PEM blocks at all.
    #[error("malformed key material: no keys found")]
    NoKeysFound,

    /// The secret has no entry under the configured field.
    #[error("secret has no {field:?} entry")]
    MissingSecretField { field: String },

    /// Reading a key file failed.
    #[error("failed to read key file {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl KeyMaterialError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Reference parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// Secret reference does not match `<namespace>/<secret-name>`.
    #[error("invalid secret reference {reference:?}: {reason}")]
    InvalidReferenceFormat { reference: String, reason: String },

    /// Image reference cannot be parsed.
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidImageReference { reference: String, reason: String },
}

impl ReferenceError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Per-key failure reported by a signature backend.
///
/// These are recorded by the trial engine and never abort the loop on their own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The key cannot be used by this backend (wrong algorithm or size).
    #[error("unsupported key {key_id}: {reason}")]
    UnsupportedKey { key_id: String, reason: String },

    /// The image has no signature manifest at all.
    #[error("no signatures found for {image}")]
    NoSignatures { image: String },

    /// Signatures exist but none verified against the key and signer.
    #[error("no matching signatures for {image}: {checked} checked, none valid for key {key_id}")]
    NoMatchingSignatures {
        image: String,
        key_id: String,
        checked: usize,
    },

    /// Registry resource not found.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Registry rejected the credentials.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Rate limit exceeded.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Network or server error.
    #[error("network error: {message}")]
    Network { message: String },

    /// Unexpected registry response.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// The attempt exceeded its time budget.
    #[error("verification attempt timed out after {after:?}")]
    Timeout { after: Duration },
}

impl BackendError {
    /// Whether the HTTP layer may retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Run-level verification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Every candidate key was tried and none matched.
    #[error("no valid signature found for any candidate key{}", fmt_last_error(.last_error))]
    NoMatchFound { last_error: Option<BackendError> },

    /// The overall run was cancelled or ran past its deadline.
    #[error("verification cancelled: {reason}")]
    Cancelled { reason: String },
}

impl VerifyError {
    /// Process exit code: 1 for a negative outcome, 3 for cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoMatchFound { .. } => 1,
            Self::Cancelled { .. } => 3,
        }
    }
}

fn fmt_last_error(last_error: &Option<BackendError>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

/// Kubernetes API errors.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Secret does not exist.
    #[error("secret not found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },

    /// Credentials rejected (401/403).
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Any other API status.
    #[error("kubernetes API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Cluster connection could not be configured.
    #[error("cluster configuration error: {message}")]
    Config { message: String },

    /// Transport failure.
    #[error("network error: {message}")]
    Network { message: String },
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

impl ClusterError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("failed to parse config YAML: {message}")]
    Parse { message: String },

    #[error("config field {field:?} is required")]
    MissingField { field: &'static str },
}

impl ConfigError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

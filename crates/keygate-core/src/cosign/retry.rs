//! Retry policy and error mapping for registry calls.
//!
//! The registry client reports failures as opaque library errors. [`classify`]
//! is the only place they are turned into [`BackendError`] variants, and the
//! variant decides whether [`with_retry`] tries again.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{BackendError, BackendResult};

/// Cap for both exponential backoff and honoured `Retry-After`.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run `op`, retrying transient failures up to `max_retries` times.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, max_retries: u32, mut op: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut retries = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retries < max_retries => {
                retries += 1;
                let backoff = backoff_for(&e, retries);

                warn!(
                    error = %e,
                    operation = what,
                    retry = retries,
                    max_retries = max_retries,
                    backoff_ms = backoff.as_millis(),
                    "retrying registry request"
                );

                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_for(error: &BackendError, retries: u32) -> Duration {
    match error {
        BackendError::RateLimited {
            retry_after: Some(retry_after),
        } => {
            let base_ms = (*retry_after).min(MAX_BACKOFF).as_millis() as u64;
            let jitter_factor: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
            let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
            Duration::from_millis(jittered_ms.max(100))
        }
        _ => {
            let base_backoff = Duration::from_secs(1 << retries.min(5)).min(MAX_BACKOFF);
            let jittered_ms = rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
            Duration::from_millis(jittered_ms.max(10))
        }
    }
}

/// Map a registry client failure on `target` to a [`BackendError`].
///
/// A `reqwest::Error` anywhere in the source chain is mapped by its status or
/// transport kind; otherwise the message is matched against registry error
/// codes and HTTP status numbers.
pub(crate) fn classify(err: &(dyn StdError + 'static), target: &str) -> BackendError {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(http) = e.downcast_ref::<reqwest::Error>() {
            return match http.status() {
                Some(status) => from_status(status.as_u16(), target, &err.to_string()),
                None => BackendError::Network {
                    message: err.to_string(),
                },
            };
        }
        source = e.source();
    }
    from_message(&err.to_string(), target)
}

fn from_status(code: u16, target: &str, message: &str) -> BackendError {
    match code {
        401 | 403 => BackendError::Unauthorized {
            message: message.to_string(),
        },
        404 => BackendError::NotFound {
            url: target.to_string(),
        },
        429 => BackendError::RateLimited { retry_after: None },
        408 | 500..=599 => BackendError::Network {
            message: message.to_string(),
        },
        _ => BackendError::InvalidResponse {
            message: message.to_string(),
        },
    }
}

const NOT_FOUND_CODES: &[&str] = &["manifest_unknown", "name_unknown", "blob_unknown", "not found"];
const UNAUTHORIZED_CODES: &[&str] = &["unauthorized", "not authorized", "denied", "authentication"];
const RATE_LIMIT_CODES: &[&str] = &["toomanyrequests", "too many requests"];
const NETWORK_CODES: &[&str] = &[
    "error sending request",
    "request error",
    "connection",
    "connect error",
    "dns error",
    "timed out",
    "broken pipe",
    "server error",
    "service unavailable",
    "bad gateway",
];

fn from_message(message: &str, target: &str) -> BackendError {
    let lower = message.to_ascii_lowercase();
    let has_phrase = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    // Status numbers must stand alone; digests and ports are full of digits.
    let status = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(|token| match token.len() {
            3 => token.parse::<u16>().ok(),
            _ => None,
        })
        .find(|code| matches!(code, 401 | 403 | 404 | 408 | 429 | 500..=599));

    if has_phrase(NOT_FOUND_CODES) || status == Some(404) {
        BackendError::NotFound {
            url: target.to_string(),
        }
    } else if has_phrase(UNAUTHORIZED_CODES) || matches!(status, Some(401 | 403)) {
        BackendError::Unauthorized {
            message: message.to_string(),
        }
    } else if has_phrase(RATE_LIMIT_CODES) || status == Some(429) {
        BackendError::RateLimited { retry_after: None }
    } else if has_phrase(NETWORK_CODES) || status.is_some() {
        BackendError::Network {
            message: message.to_string(),
        }
    } else {
        BackendError::InvalidResponse {
            message: message.to_string(),
        }
    }
}

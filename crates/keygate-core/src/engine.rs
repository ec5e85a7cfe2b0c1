//! Multi-key verification trial loop.
//!
//! Candidate keys are tried one at a time, in order. The first key for which
//! the backend returns at least one attestation wins and the remaining keys
//! are never tried. Per-key failures are recorded (only the last one is kept)
//! and do not stop the loop; cancelling the overall run does.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::backend::{SignatureAttestation, SignatureBackend};
use crate::error::{BackendError, VerifyError};
use crate::keys::PublicKey;
use crate::reference::ImageRef;

/// Input of one verification run.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub image: ImageRef,
    pub expected_signer: String,
    pub candidate_keys: Vec<PublicKey>,
}

impl VerificationRequest {
    pub fn new(image: ImageRef, expected_signer: impl Into<String>, keys: Vec<PublicKey>) -> Self {
        Self {
            image,
            expected_signer: expected_signer.into(),
            candidate_keys: keys,
        }
    }
}

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub matched: bool,

    /// Attestations produced by the winning key. Empty unless `matched`.
    pub signatures: Vec<SignatureAttestation>,

    /// Index into `candidate_keys` of the winning key.
    pub matched_key: Option<usize>,

    /// Error from the last failed attempt. Cleared when a key matches.
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<BackendError>,

    /// Number of backend invocations made.
    pub attempts: usize,
}

impl VerificationOutcome {
    /// Turn a negative outcome into [`VerifyError::NoMatchFound`].
    pub fn into_result(self) -> Result<Self, VerifyError> {
        if self.matched {
            Ok(self)
        } else {
            Err(VerifyError::NoMatchFound {
                last_error: self.last_error,
            })
        }
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<BackendError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Trips the cancellation signal of every [`VerifyContext`] created from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// A context observing this handle.
    pub fn context(&self) -> VerifyContext {
        VerifyContext {
            cancel: Some(self.tx.subscribe()),
            ..VerifyContext::default()
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline and cancellation for a verification run.
#[derive(Debug, Clone, Default)]
pub struct VerifyContext {
    deadline: Option<Instant>,
    attempt_timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

impl VerifyContext {
    /// A context that never expires.
    pub fn background() -> Self {
        Self::default()
    }

    /// Fail the whole run once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Bound each backend call; an expired attempt counts as a key failure.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Why the run can no longer continue, if it can't.
    fn interruption(&self) -> Option<String> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some("deadline exceeded".to_string());
            }
        }
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some("cancelled by caller".to_string());
            }
        }
        None
    }

    async fn interrupted(&self) -> String {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match self.cancel.clone() {
                // A dropped handle can never cancel.
                Some(mut rx) => {
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = deadline => "deadline exceeded".to_string(),
            _ = cancelled => "cancelled by caller".to_string(),
        }
    }

    /// Run one backend attempt under this context.
    ///
    /// The outer `Err` means the whole run must stop.
    async fn run_attempt<F, T>(&self, attempt: F) -> Result<Result<T, BackendError>, VerifyError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let bounded = async {
            match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, attempt)
                    .await
                    .unwrap_or(Err(BackendError::Timeout { after: limit })),
                None => attempt.await,
            }
        };

        tokio::select! {
            biased;
            reason = self.interrupted() => Err(VerifyError::Cancelled { reason }),
            result = bounded => Ok(result),
        }
    }
}

/// Drives per-key verification attempts against a backend.
#[derive(Debug)]
pub struct TrialEngine<B> {
    backend: B,
}

impl<B: SignatureBackend> TrialEngine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Try each candidate key in order until one yields attestations.
    ///
    /// Returns `Err` only when `ctx` is cancelled or its deadline passes.
    #[tracing::instrument(
        skip(self, request, ctx),
        fields(image = %request.image, signer = %request.expected_signer, keys = request.candidate_keys.len())
    )]
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        ctx: &VerifyContext,
    ) -> Result<VerificationOutcome, VerifyError> {
        if request.candidate_keys.is_empty() {
            tracing::warn!("no candidate keys; trust-root verification is not supported");
        }

        let mut last_error = None;
        let mut attempts = 0;

        for (index, key) in request.candidate_keys.iter().enumerate() {
            if let Some(reason) = ctx.interruption() {
                tracing::warn!(reason = %reason, remaining = request.candidate_keys.len() - index, "verification interrupted");
                return Err(VerifyError::Cancelled { reason });
            }

            let key_id = key.key_id();
            tracing::debug!(key = index, key_id = %key_id, "trying key");
            attempts += 1;

            let attempt =
                self.backend
                    .verify_image(&request.image, key, &request.expected_signer);

            match ctx.run_attempt(attempt).await? {
                Ok(signatures) if !signatures.is_empty() => {
                    tracing::info!(
                        key = index,
                        key_id = %key_id,
                        signatures = signatures.len(),
                        "valid signatures"
                    );
                    if let Some(previous) = &last_error {
                        tracing::debug!(error = %previous, "discarding earlier key failure");
                    }
                    return Ok(VerificationOutcome {
                        matched: true,
                        signatures,
                        matched_key: Some(index),
                        last_error: None,
                        attempts,
                    });
                }
                Ok(_) => {
                    tracing::debug!(key = index, key_id = %key_id, "backend returned no signatures");
                }
                Err(e) => {
                    tracing::warn!(key = index, key_id = %key_id, error = %e, "checking signatures");
                    last_error = Some(e);
                }
            }
        }

        tracing::info!(attempts, "no valid signatures were found");
        Ok(VerificationOutcome {
            matched: false,
            signatures: Vec::new(),
            matched_key: None,
            last_error,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendResult;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    /// Scripted backend keyed by key id; records every key it was asked about.
    #[derive(Default)]
    struct ScriptedBackend {
        script: HashMap<String, BackendResult<Vec<SignatureAttestation>>>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn on(mut self, key: &PublicKey, result: BackendResult<Vec<SignatureAttestation>>) -> Self {
            self.script.insert(key.key_id(), result);
            self
        }

        fn delay(mut self, key: &PublicKey, delay: Duration) -> Self {
            self.delays.insert(key.key_id(), delay);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignatureBackend for ScriptedBackend {
        async fn verify_image(
            &self,
            _image: &ImageRef,
            key: &PublicKey,
            _expected_signer: &str,
        ) -> BackendResult<Vec<SignatureAttestation>> {
            let key_id = key.key_id();
            self.calls.lock().unwrap().push(key_id.clone());
            if let Some(delay) = self.delays.get(&key_id) {
                tokio::time::sleep(*delay).await;
            }
            self.script
                .get(&key_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn test_key(seed: u8) -> PublicKey {
        use pkcs8::EncodePublicKey;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        let der = signing_key.verifying_key().to_public_key_der().unwrap();
        PublicKey::from_spki_der(der.as_bytes()).unwrap()
    }

    fn attestation(key: &PublicKey) -> SignatureAttestation {
        SignatureAttestation {
            key_id: key.key_id(),
            image_digest: "sha256:abc".to_string(),
            docker_reference: "ghcr.io/acme/api".to_string(),
            signer: Some("ci@acme.dev".to_string()),
            annotations: BTreeMap::new(),
            layer_digest: "sha256:def".to_string(),
            signature: "MEUC".to_string(),
        }
    }

    fn request(keys: Vec<PublicKey>) -> VerificationRequest {
        VerificationRequest::new(
            ImageRef::parse("ghcr.io/acme/api:1.0").unwrap(),
            "ci@acme.dev",
            keys,
        )
    }

    fn network(message: &str) -> BackendError {
        BackendError::Network {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let (k1, k2, k3) = (test_key(1), test_key(2), test_key(3));
        let backend = ScriptedBackend::default()
            .on(&k1, Err(network("registry down")))
            .on(&k2, Ok(vec![attestation(&k2)]))
            .on(&k3, Ok(vec![attestation(&k3)]));
        let engine = TrialEngine::new(backend);

        let outcome = engine
            .verify(&request(vec![k1.clone(), k2.clone(), k3.clone()]), &VerifyContext::background())
            .await
            .unwrap();

        assert!(outcome.matched);
        assert_eq!(outcome.matched_key, Some(1));
        assert_eq!(outcome.signatures, vec![attestation(&k2)]);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(engine.backend().calls(), vec![k1.key_id(), k2.key_id()]);
    }

    #[tokio::test]
    async fn test_all_fail_keeps_last_error() {
        let (k1, k2) = (test_key(1), test_key(2));
        let k2_error = BackendError::NoMatchingSignatures {
            image: "ghcr.io/acme/api:1.0".to_string(),
            key_id: k2.key_id(),
            checked: 2,
        };
        let backend = ScriptedBackend::default()
            .on(&k1, Err(network("registry down")))
            .on(&k2, Err(k2_error.clone()));
        let engine = TrialEngine::new(backend);

        let outcome = engine
            .verify(&request(vec![k1, k2]), &VerifyContext::background())
            .await
            .unwrap();

        assert!(!outcome.matched);
        assert!(outcome.signatures.is_empty());
        assert_eq!(outcome.last_error, Some(k2_error.clone()));
        assert_eq!(outcome.attempts, 2);

        let err = outcome.into_result().unwrap_err();
        assert_eq!(
            err,
            VerifyError::NoMatchFound {
                last_error: Some(k2_error)
            }
        );
    }

    #[tokio::test]
    async fn test_empty_keys_no_error() {
        let engine = TrialEngine::new(ScriptedBackend::default());
        let outcome = engine
            .verify(&request(vec![]), &VerifyContext::background())
            .await
            .unwrap();

        assert!(!outcome.matched);
        assert_eq!(outcome.last_error, None);
        assert_eq!(outcome.attempts, 0);
        assert!(engine.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_attestations_is_not_an_error() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(&k1, Err(network("flaky")))
            .on(&k2, Ok(vec![]));
        let engine = TrialEngine::new(backend);

        let outcome = engine
            .verify(&request(vec![k1, k2]), &VerifyContext::background())
            .await
            .unwrap();

        assert!(!outcome.matched);
        // k2 returned nothing without failing; the k1 error is still the last one.
        assert_eq!(outcome.last_error, Some(network("flaky")));
    }

    #[tokio::test]
    async fn test_unsupported_key_is_per_key_failure() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(
                &k1,
                Err(BackendError::UnsupportedKey {
                    key_id: k1.key_id(),
                    reason: "rsa keys are not supported".to_string(),
                }),
            )
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = TrialEngine::new(backend);

        let outcome = engine
            .verify(&request(vec![k1, k2]), &VerifyContext::background())
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.matched_key, Some(1));
    }

    #[tokio::test]
    async fn test_repeated_runs_are_idempotent() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(&k1, Err(network("down")))
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = TrialEngine::new(backend);
        let req = request(vec![k1, k2]);

        let first = engine.verify(&req, &VerifyContext::background()).await.unwrap();
        let second = engine.verify(&req, &VerifyContext::background()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_moves_to_next_key() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(&k1, Ok(vec![attestation(&k1)]))
            .delay(&k1, Duration::from_secs(60))
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = TrialEngine::new(backend);
        let ctx = VerifyContext::background().with_attempt_timeout(Duration::from_secs(5));

        let outcome = engine
            .verify(&request(vec![k1.clone(), k2.clone()]), &ctx)
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.matched_key, Some(1));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.last_error, None);
        assert_eq!(engine.backend().calls(), vec![k1.key_id(), k2.key_id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeouts_inside_live_deadline() {
        let (k1, k2, k3) = (test_key(1), test_key(2), test_key(3));
        let backend = ScriptedBackend::default()
            .delay(&k1, Duration::from_secs(60))
            .delay(&k2, Duration::from_secs(60))
            .on(&k3, Ok(vec![attestation(&k3)]));
        let engine = TrialEngine::new(backend);
        let ctx = VerifyContext::background()
            .with_timeout(Duration::from_secs(12))
            .with_attempt_timeout(Duration::from_secs(5));

        let outcome = engine
            .verify(&request(vec![k1, k2, k3.clone()]), &ctx)
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.matched_key, Some(2));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.signatures, vec![attestation(&k3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_after_attempt_timeout() {
        let (k1, k2, k3) = (test_key(1), test_key(2), test_key(3));
        let backend = ScriptedBackend::default()
            .delay(&k1, Duration::from_secs(60))
            .delay(&k2, Duration::from_secs(60))
            .on(&k3, Ok(vec![attestation(&k3)]));
        let engine = TrialEngine::new(backend);
        let ctx = VerifyContext::background()
            .with_timeout(Duration::from_secs(8))
            .with_attempt_timeout(Duration::from_secs(5));

        let result = engine
            .verify(&request(vec![k1.clone(), k2.clone(), k3]), &ctx)
            .await;
        assert_eq!(
            result,
            Err(VerifyError::Cancelled {
                reason: "deadline exceeded".to_string()
            })
        );
        assert_eq!(engine.backend().calls(), vec![k1.key_id(), k2.key_id()]);
    }

    #[tokio::test]
    async fn test_matched_outcome_clears_earlier_failure() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(&k1, Err(network("registry down")))
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = TrialEngine::new(backend);

        let outcome = engine
            .verify(&request(vec![k1, k2]), &VerifyContext::background())
            .await
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.last_error, None);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["last_error"], serde_json::Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_stops_run() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .on(&k1, Ok(vec![attestation(&k1)]))
            .delay(&k1, Duration::from_secs(60))
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = TrialEngine::new(backend);
        let ctx = VerifyContext::background().with_timeout(Duration::from_secs(10));

        let result = engine.verify(&request(vec![k1.clone(), k2]), &ctx).await;
        assert!(matches!(result, Err(VerifyError::Cancelled { .. })));
        assert_eq!(engine.backend().calls(), vec![k1.key_id()]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let k1 = test_key(1);
        let engine = TrialEngine::new(ScriptedBackend::default().on(&k1, Ok(vec![attestation(&k1)])));
        let handle = CancelHandle::new();
        let ctx = handle.context();
        handle.cancel();

        let result = engine.verify(&request(vec![k1]), &ctx).await;
        assert_eq!(
            result,
            Err(VerifyError::Cancelled {
                reason: "cancelled by caller".to_string()
            })
        );
        assert!(engine.backend().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt() {
        let (k1, k2) = (test_key(1), test_key(2));
        let backend = ScriptedBackend::default()
            .delay(&k1, Duration::from_secs(60))
            .on(&k2, Ok(vec![attestation(&k2)]));
        let engine = Arc::new(TrialEngine::new(backend));
        let handle = CancelHandle::new();
        let ctx = handle.context();

        let task = {
            let engine = engine.clone();
            let req = request(vec![k1.clone(), k2]);
            tokio::spawn(async move { engine.verify(&req, &ctx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(VerifyError::Cancelled { .. })));
        assert_eq!(engine.backend().calls(), vec![k1.key_id()]);
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let k1 = test_key(1);
        let engine = TrialEngine::new(ScriptedBackend::default().on(&k1, Ok(vec![attestation(&k1)])));
        let ctx = CancelHandle::new().context();

        let outcome = engine.verify(&request(vec![k1]), &ctx).await.unwrap();
        assert!(outcome.matched);
    }
}

//! Cosign signature backend.
//!
//! Signatures live in the registry next to the image, in a manifest tagged
//! `sha256-<hex>.sig`. Locating that manifest, pulling its layers and checking
//! signatures is done by the `sigstore` crate; this module decides which
//! layers count for one key and one expected signer.
//!
//! Verification is offline against the supplied public key; transparency-log
//! inclusion is not checked.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sigstore::cosign::verification_constraint::{
    AnnotationVerifier, PublicKeyVerifier, VerificationConstraint,
};
use sigstore::cosign::{ClientBuilder, CosignCapabilities, SignatureLayer};
use sigstore::registry::{Auth, ClientConfig, ClientProtocol};
use tracing::debug;

use crate::backend::{SignatureAttestation, SignatureBackend};
use crate::error::{BackendError, BackendResult};
use crate::keys::PublicKey;
use crate::reference::ImageRef;

pub mod auth;
mod retry;

pub use auth::RegistryAuth;

use retry::{classify, with_retry};

/// Simple-signing annotation holding the signer identity.
pub const SIGNER_ANNOTATION: &str = "signer";

/// Registry connection settings for [`CosignBackend`].
#[derive(Debug, Clone)]
pub struct CosignOptions {
    pub auth: RegistryAuth,
    /// Registries reached over plain HTTP. Loopback registries always are.
    pub insecure_registries: Vec<String>,
    /// Maximum retries for transient registry failures.
    pub max_retries: u32,
}

impl Default for CosignOptions {
    fn default() -> Self {
        Self {
            auth: RegistryAuth::Anonymous,
            insecure_registries: Vec::new(),
            max_retries: 3,
        }
    }
}

/// [`SignatureBackend`] backed by cosign signatures in an OCI registry.
#[derive(Debug, Clone, Default)]
pub struct CosignBackend {
    options: CosignOptions,
}

impl CosignBackend {
    pub fn new(options: CosignOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CosignOptions {
        &self.options
    }

    /// Registries the client should reach over plain HTTP for `image`.
    fn plain_http_registries(&self, image: &ImageRef) -> Vec<String> {
        let mut registries = self.options.insecure_registries.clone();
        let host = image.registry().split(':').next().unwrap_or_default();
        if matches!(host, "localhost" | "127.0.0.1") && !registries.iter().any(|r| r == image.registry()) {
            registries.push(image.registry().to_string());
        }
        registries
    }

    fn client(&self, image: &ImageRef) -> BackendResult<sigstore::cosign::Client> {
        let mut config = ClientConfig::default();
        config.protocol = ClientProtocol::HttpsExcept(self.plain_http_registries(image));
        ClientBuilder::default()
            .with_oci_client_config(config)
            .build()
            .map_err(|e| BackendError::InvalidResponse {
                message: format!("failed to create registry client: {}", e),
            })
    }

    /// Resolve the image digest and pull the layers of its signature manifest.
    async fn signature_layers(&self, image: &ImageRef) -> BackendResult<(String, Vec<SignatureLayer>)> {
        let auth = Auth::from(&self.options.auth);
        let auth = &auth;
        let retries = self.options.max_retries;

        let (cosign_image, digest) = with_retry("resolve signature location", retries, || async move {
            let mut client = self.client(image)?;
            client
                .triangulate(image.oci(), auth)
                .await
                .map_err(|e| classify(&e, &image.to_string()))
        })
        .await?;
        debug!(image = %image, digest = %digest, signatures = %cosign_image, "resolved image digest");

        let (cosign_image, digest) = (&cosign_image, digest.as_str());
        let layers = with_retry("fetch signature layers", retries, || async move {
            let mut client = self.client(image)?;
            client
                .trusted_signature_layers(auth, digest, cosign_image)
                .await
                .map_err(|e| match classify(&e, &cosign_image.to_string()) {
                    BackendError::NotFound { .. } => BackendError::NoSignatures {
                        image: image.to_string(),
                    },
                    other => other,
                })
        })
        .await?;

        Ok((digest.to_string(), layers))
    }
}

/// Constraints a layer must meet for one key and signer.
struct LayerCheck {
    key: PublicKeyVerifier,
    signer: AnnotationVerifier,
}

impl LayerCheck {
    fn new(key: &PublicKey, expected_signer: &str) -> BackendResult<Self> {
        let verifier = PublicKeyVerifier::try_from(key.to_pem().as_bytes()).map_err(|e| {
            BackendError::UnsupportedKey {
                key_id: key.key_id(),
                reason: e.to_string(),
            }
        })?;
        let signer = AnnotationVerifier {
            annotations: BTreeMap::from([(
                SIGNER_ANNOTATION.to_string(),
                expected_signer.to_string(),
            )]),
        };
        Ok(Self {
            key: verifier,
            signer,
        })
    }

    /// Why `layer` does not count, if it doesn't.
    fn rejection(&self, layer: &SignatureLayer, digest: &str) -> Option<&'static str> {
        let critical = &layer.simple_signing.critical;
        if critical.image.docker_manifest_digest != digest {
            return Some("payload covers a different manifest digest");
        }
        match self.key.verify(layer) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Some("signature does not verify with key"),
        }
        match self.signer.verify(layer) {
            Ok(true) => None,
            Ok(false) | Err(_) => Some("signer annotation does not match"),
        }
    }
}

fn attestation(key_id: &str, digest: &str, layer: &SignatureLayer) -> SignatureAttestation {
    let annotations: BTreeMap<String, serde_json::Value> = layer
        .simple_signing
        .optional
        .as_ref()
        .and_then(|optional| serde_json::to_value(optional).ok())
        .and_then(|value| match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .map(|map| map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        .unwrap_or_default();
    let signer = annotations
        .get(SIGNER_ANNOTATION)
        .and_then(|v| v.as_str())
        .map(String::from);

    SignatureAttestation {
        key_id: key_id.to_string(),
        image_digest: digest.to_string(),
        docker_reference: layer.simple_signing.critical.identity.docker_reference.clone(),
        signer,
        annotations,
        layer_digest: layer.oci_digest.clone(),
        signature: layer.signature.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl SignatureBackend for CosignBackend {
    async fn verify_image(
        &self,
        image: &ImageRef,
        key: &PublicKey,
        expected_signer: &str,
    ) -> BackendResult<Vec<SignatureAttestation>> {
        let check = LayerCheck::new(key, expected_signer)?;
        let key_id = key.key_id();

        let (digest, layers) = self.signature_layers(image).await?;
        if layers.is_empty() {
            return Err(BackendError::NoSignatures {
                image: image.to_string(),
            });
        }

        let mut attestations = Vec::new();
        for layer in &layers {
            match check.rejection(layer, &digest) {
                None => attestations.push(attestation(&key_id, &digest, layer)),
                Some(reason) => {
                    debug!(layer = %layer.oci_digest, key_id = %key_id, reason, "signature layer rejected");
                }
            }
        }

        if attestations.is_empty() {
            return Err(BackendError::NoMatchingSignatures {
                image: image.to_string(),
                key_id,
                checked: layers.len(),
            });
        }
        Ok(attestations)
    }
}

//! Signature backend seam.
//!
//! A backend performs one key's worth of verification: given an image and a
//! public key it returns the signatures on that image that the key validly
//! signed for the expected signer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;
use crate::keys::PublicKey;
use crate::reference::ImageRef;

/// One valid signature found on an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureAttestation {
    /// Key that verified the signature (`sha256:<hex>` of the SPKI).
    pub key_id: String,

    /// Manifest digest the signature covers.
    pub image_digest: String,

    /// `critical.identity.docker-reference` from the signed payload.
    pub docker_reference: String,

    /// Signer annotation from the signed payload.
    #[serde(default)]
    pub signer: Option<String>,

    /// All optional annotations from the signed payload.
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,

    /// Digest of the signature layer (payload blob).
    pub layer_digest: String,

    /// Base64 signature as stored in the layer annotation.
    pub signature: String,
}

/// Verifies an image against a single public key.
#[async_trait]
pub trait SignatureBackend: Send + Sync {
    /// Return the attestations on `image` that `key` validly signed with a
    /// signer claim equal to `expected_signer`.
    async fn verify_image(
        &self,
        image: &ImageRef,
        key: &PublicKey,
        expected_signer: &str,
    ) -> BackendResult<Vec<SignatureAttestation>>;
}

#[async_trait]
impl<B: SignatureBackend + ?Sized> SignatureBackend for Arc<B> {
    async fn verify_image(
        &self,
        image: &ImageRef,
        key: &PublicKey,
        expected_signer: &str,
    ) -> BackendResult<Vec<SignatureAttestation>> {
        (**self).verify_image(image, key, expected_signer).await
    }
}

//! Multi-key cosign signature verification for container images.
//!
//! Public keys are read from a Kubernetes secret (`k8s://<namespace>/<name>`)
//! holding one or more concatenated PEM `PUBLIC KEY` blocks. Each key is tried
//! in order against the image's cosign signatures; the first key with a valid
//! signature for the expected signer wins.
//!
//! - PEM key-material decoding with per-block error reporting
//! - Secret and image reference parsing
//! - Trial engine with deadline, per-attempt timeout and cancellation
//! - Cosign backend built on the `sigstore` crate
//! - Kubernetes secret access via kubeconfig or in-cluster service account
//!
//! # Quick Start
//!
//! ```no_run
//! use keygate_core::{
//!     decode, CosignBackend, ImageRef, TrialEngine, VerificationRequest, VerifyContext,
//! };
//!
//! # async fn example(pem: &[u8]) -> anyhow::Result<()> {
//! let keys = decode(pem)?.keys;
//! let image = ImageRef::parse("ghcr.io/acme/api:1.4.2")?;
//!
//! let engine = TrialEngine::new(CosignBackend::default());
//! let request = VerificationRequest::new(image, "ci@acme.dev", keys);
//! let outcome = engine.verify(&request, &VerifyContext::background()).await?;
//! if outcome.matched {
//!     println!("verified by key #{:?}", outcome.matched_key);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `KEYGATE_REGISTRY_USERNAME` | Registry basic-auth username |
//! | `KEYGATE_REGISTRY_PASSWORD` | Registry basic-auth password |
//! | `KEYGATE_KUBECONFIG` | Kubeconfig path |

pub mod backend;
pub mod cluster;
pub mod config;
pub mod cosign;
pub mod engine;
pub mod error;
pub mod keys;
pub mod reference;

// Re-export main types
pub use backend::{SignatureAttestation, SignatureBackend};
pub use cluster::{KubeClient, Secret, SecretStore};
pub use config::Config;
pub use cosign::{CosignBackend, CosignOptions, RegistryAuth};
pub use engine::{
    CancelHandle, TrialEngine, VerificationOutcome, VerificationRequest, VerifyContext,
};
pub use error::{
    BackendError, BackendResult, ClusterError, ConfigError, DecodeError, KeyMaterialError,
    ReferenceError, VerifyError,
};
pub use keys::{decode, decode_secret, load_key_file, DecodedKeys, KeyAlgorithm, PublicKey};
pub use reference::{ImageRef, SecretRef};

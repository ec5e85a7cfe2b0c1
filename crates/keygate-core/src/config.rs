//! Verification config file (`cosignConfig.yaml`).
//!
//! ```yaml
//! registry: ghcr.io
//! image: acme/api
//! tag: "1.4.2"
//! signer: ci@acme.dev
//! secretKeyRef: k8s://security/cosign-keys
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cosign::{CosignOptions, RegistryAuth};
use crate::error::{ConfigError, ReferenceError};
use crate::keys::DEFAULT_SECRET_KEY_FIELD;
use crate::reference::{ImageRef, SecretRef};

/// Environment variables that override config values.
pub const ENV_REGISTRY_USERNAME: &str = "KEYGATE_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "KEYGATE_REGISTRY_PASSWORD";
pub const ENV_KUBECONFIG: &str = "KEYGATE_KUBECONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub tag: String,
    /// Required `signer` annotation on the signature payload.
    #[serde(default)]
    pub signer: String,
    /// `k8s://<namespace>/<secret-name>` holding the public keys.
    #[serde(default)]
    pub secret_key_ref: String,
    /// Secret data field with the PEM keys.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuthConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,

    /// Overall verification budget, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Budget for a single key's attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,
    /// Maximum retries for transient registry failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for RegistryAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY_FIELD.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, &str); 5] = [
            ("registry", &self.registry),
            ("image", &self.image),
            ("tag", &self.tag),
            ("signer", &self.signer),
            ("secretKeyRef", &self.secret_key_ref),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField { field });
            }
        }
        if self.secret_key.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "secretKey" });
        }
        Ok(())
    }

    /// Apply `KEYGATE_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let username = lookup(ENV_REGISTRY_USERNAME);
        let password = lookup(ENV_REGISTRY_PASSWORD);

        if username.is_some() || password.is_some() {
            let auth = self.registry_auth.get_or_insert_with(Default::default);
            if username.is_some() {
                auth.username = username;
            }
            if password.is_some() {
                auth.password = password;
            }
        }

        if let Some(path) = lookup(ENV_KUBECONFIG) {
            self.kubeconfig = Some(PathBuf::from(path));
        }
        self
    }

    /// `registry/image:tag`.
    pub fn image_ref(&self) -> Result<ImageRef, ReferenceError> {
        ImageRef::from_parts(&self.registry, &self.image, &self.tag)
    }

    pub fn secret_ref(&self) -> Result<SecretRef, ReferenceError> {
        SecretRef::parse(&self.secret_key_ref)
    }

    pub fn registry_auth(&self) -> RegistryAuth {
        match &self.registry_auth {
            Some(auth) => RegistryAuth::from_parts(auth.username.clone(), auth.password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }

    pub fn cosign_options(&self) -> CosignOptions {
        CosignOptions {
            auth: self.registry_auth(),
            insecure_registries: self.insecure_registries.clone(),
            max_retries: self.max_retries,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }
}

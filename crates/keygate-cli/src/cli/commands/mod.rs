pub mod dispatch;
pub mod keys;
pub mod verify;

pub use dispatch::dispatch;

use anyhow::{Context, Result};
use keygate_core::{decode_secret, load_key_file, DecodedKeys, KubeClient, SecretStore};
use std::path::Path;

use keygate_core::Config;

/// Where a command reads its candidate keys from.
pub(crate) enum KeySource<'a> {
    File(&'a Path),
    Secret {
        config: &'a Config,
        kubeconfig: Option<&'a Path>,
    },
}

pub(crate) async fn load_keys(source: KeySource<'_>) -> Result<DecodedKeys> {
    match source {
        KeySource::File(path) => load_key_file(path)
            .with_context(|| format!("failed to load keys from {}", path.display())),
        KeySource::Secret { config, kubeconfig } => {
            let secret_ref = config.secret_ref()?;
            let kubeconfig = kubeconfig.or(config.kubeconfig.as_deref());
            let client = KubeClient::infer(kubeconfig).context("failed to configure cluster access")?;

            tracing::info!(secret = %secret_ref, field = %config.secret_key, "reading key secret");
            let secret = client
                .get_secret(&secret_ref.namespace, &secret_ref.name)
                .await
                .with_context(|| format!("failed to read secret {}", secret_ref))?;

            decode_secret(&secret.data, &config.secret_key)
                .with_context(|| format!("failed to decode keys from secret {}", secret_ref))
        }
    }
}

pub(crate) fn load_config(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    Ok(config.with_env_overrides())
}

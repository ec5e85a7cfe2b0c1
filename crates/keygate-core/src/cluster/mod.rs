//! Kubernetes secret access.
//!
//! [`SecretStore`] is the seam the CLI reads key material through;
//! [`KubeClient`] implements it against the core/v1 Secrets API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::debug;

use crate::error::ClusterError;

pub mod kubeconfig;

pub use kubeconfig::{Connection, Credentials, Kubeconfig};

/// Service-account mount used by in-cluster configuration.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A secret's decoded data entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Read access to cluster secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    message: Option<String>,
}

/// Minimal Kubernetes API client.
#[derive(Clone)]
pub struct KubeClient {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KubeClient {
    pub fn from_connection(connection: Connection) -> Result<Self, ClusterError> {
        let config_err = |what: &str, e: reqwest::Error| ClusterError::Config {
            message: format!("{}: {}", what, e),
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(ca) = &connection.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| config_err("invalid certificate authority", e))?;
            builder = builder.add_root_certificate(cert);
        }
        if connection.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let token = match connection.credentials {
            Credentials::None => None,
            Credentials::Token(token) => Some(token),
            Credentials::ClientCertificate { cert_pem, key_pem } => {
                let mut pem = key_pem;
                pem.push(b'\n');
                pem.extend_from_slice(&cert_pem);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| config_err("invalid client certificate", e))?;
                builder = builder.identity(identity);
                None
            }
        };

        let client = builder
            .build()
            .map_err(|e| config_err("failed to create HTTP client", e))?;

        Ok(Self {
            client,
            server: connection.server,
            token,
        })
    }

    /// Client for the current context of a kubeconfig file.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, ClusterError> {
        debug!(path = %path.display(), "loading kubeconfig");
        Self::from_connection(Kubeconfig::from_path(path)?.connection()?)
    }

    /// Client from the pod's service account.
    pub fn in_cluster() -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| ClusterError::Config {
            message: "KUBERNETES_SERVICE_HOST not set - not running in a cluster".into(),
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let read = |file: &str| {
            std::fs::read(dir.join(file)).map_err(|e| ClusterError::Config {
                message: format!("failed to read service account {}: {}", file, e),
            })
        };
        let token = String::from_utf8_lossy(&read("token")?).trim().to_string();
        let ca_pem = read("ca.crt")?;

        debug!(host = %host, port = %port, "using in-cluster configuration");
        Self::from_connection(Connection {
            server: format!("https://{}:{}", host, port),
            ca_pem: Some(ca_pem),
            insecure_skip_tls_verify: false,
            credentials: Credentials::Token(token),
        })
    }

    /// Discover cluster access.
    ///
    /// Checks in order:
    /// 1. `explicit` kubeconfig path
    /// 2. `KUBECONFIG` (first entry)
    /// 3. in-cluster service account
    /// 4. `~/.kube/config`
    pub fn infer(explicit: Option<&Path>) -> Result<Self, ClusterError> {
        if let Some(path) = explicit {
            return Self::from_kubeconfig(path);
        }

        if let Some(path) = env_kubeconfig() {
            return Self::from_kubeconfig(&path);
        }

        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            return Self::in_cluster();
        }

        match dirs::home_dir().map(|home| home.join(".kube").join("config")) {
            Some(path) if path.exists() => Self::from_kubeconfig(&path),
            _ => Err(ClusterError::Config {
                message: "no kubeconfig found and not running in a cluster".into(),
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

fn env_kubeconfig() -> Option<PathBuf> {
    let value = std::env::var_os("KUBECONFIG")?;
    std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty())
}

#[async_trait]
impl SecretStore for KubeClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.server, namespace, name
        );
        debug!(url = %url, "fetching secret");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => {}
            404 => {
                return Err(ClusterError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            401 | 403 => {
                return Err(ClusterError::Unauthorized {
                    message: status_message(response).await,
                })
            }
            code => {
                return Err(ClusterError::Api {
                    status: code,
                    message: status_message(response).await,
                })
            }
        }

        let body: SecretResponse = response.json().await.map_err(|e| ClusterError::Api {
            status: status.as_u16(),
            message: format!("failed to parse secret: {}", e),
        })?;

        let mut data = BTreeMap::new();
        for (key, value) in body.data.unwrap_or_default() {
            let decoded = BASE64.decode(value.trim()).map_err(|e| ClusterError::Api {
                status: status.as_u16(),
                message: format!("secret entry {:?} is not valid base64: {}", key, e),
            })?;
            data.insert(key, decoded);
        }

        Ok(Secret { data })
    }
}

/// `message` of a Kubernetes Status body, or the HTTP status text.
async fn status_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<StatusResponse>(&text)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or_else(|| status.to_string())
}

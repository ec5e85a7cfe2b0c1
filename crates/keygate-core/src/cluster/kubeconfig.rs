//! Kubeconfig parsing.
//!
//! Only the pieces needed to reach the API server are modelled: the current
//! context's cluster (server, CA, TLS skip) and user (token, token file or
//! client certificate). Relative file paths resolve against the directory
//! holding the kubeconfig.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;

use crate::error::ClusterError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,

    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    #[serde(default)]
    pub certificate_authority: Option<String>,
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<String>,
    #[serde(default)]
    pub client_certificate: Option<String>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub client_key_data: Option<String>,
}

/// Everything needed to open a connection to the API server.
#[derive(Clone)]
pub struct Connection {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub credentials: Credentials,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("ca_pem", &self.ca_pem.as_ref().map(|c| c.len()))
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("credentials", &self.credentials.kind())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Token(String),
    ClientCertificate { cert_pem: Vec<u8>, key_pem: Vec<u8> },
}

impl Credentials {
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token(_) => "token",
            Self::ClientCertificate { .. } => "client-certificate",
        }
    }
}

fn config_err(message: impl Into<String>) -> ClusterError {
    ClusterError::Config {
        message: message.into(),
    }
}

impl Kubeconfig {
    /// Read a kubeconfig file.
    pub fn from_path(path: &Path) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| config_err(format!("failed to read kubeconfig {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ClusterError> {
        serde_yaml::from_str(content).map_err(|e| config_err(format!("invalid kubeconfig: {}", e)))
    }

    /// Resolve the current context into a connection.
    pub fn connection(&self) -> Result<Connection, ClusterError> {
        let context_name = self
            .current_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| config_err("kubeconfig has no current-context"))?;

        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| config_err(format!("context {:?} not found in kubeconfig", context_name)))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| config_err(format!("cluster {:?} not found in kubeconfig", context.cluster)))?;

        let user = match &context.user {
            Some(name) => Some(
                self.users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| config_err(format!("user {:?} not found in kubeconfig", name)))?,
            ),
            None => None,
        };

        let ca_pem = self.inline_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            "certificate-authority",
        )?;

        let credentials = match user {
            Some(user) => self.credentials(user)?,
            None => Credentials::None,
        };

        Ok(Connection {
            server: cluster.server.trim_end_matches('/').to_string(),
            ca_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            credentials,
        })
    }

    fn credentials(&self, user: &UserEntry) -> Result<Credentials, ClusterError> {
        if let Some(token) = user.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Credentials::Token(token.to_string()));
        }
        if let Some(file) = &user.token_file {
            let path = self.resolve_path(file);
            let token = std::fs::read_to_string(&path).map_err(|e| {
                config_err(format!("failed to read token file {}: {}", path.display(), e))
            })?;
            return Ok(Credentials::Token(token.trim().to_string()));
        }

        let cert = self.inline_or_file(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            "client-certificate",
        )?;
        let key = self.inline_or_file(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            "client-key",
        )?;

        match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => Ok(Credentials::ClientCertificate { cert_pem, key_pem }),
            (None, None) => Ok(Credentials::None),
            _ => Err(config_err(
                "client certificate and client key must be configured together",
            )),
        }
    }

    /// `*-data` (base64) wins over the file path.
    fn inline_or_file(
        &self,
        data: Option<&str>,
        file: Option<&str>,
        what: &str,
    ) -> Result<Option<Vec<u8>>, ClusterError> {
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            let bytes = BASE64
                .decode(data.trim())
                .map_err(|e| config_err(format!("invalid {}-data: {}", what, e)))?;
            return Ok(Some(bytes));
        }
        match file.filter(|f| !f.is_empty()) {
            Some(file) => {
                let path = self.resolve_path(file);
                std::fs::read(&path)
                    .map(Some)
                    .map_err(|e| config_err(format!("failed to read {} {}: {}", what, path.display(), e)))
            }
            None => Ok(None),
        }
    }

    fn resolve_path(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: prod
clusters:
  - name: prod-cluster
    cluster:
      server: https://10.0.0.1:6443/
      certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t
  - name: dev-cluster
    cluster:
      server: https://dev:6443
      insecure-skip-tls-verify: true
contexts:
  - name: prod
    context:
      cluster: prod-cluster
      user: deployer
      namespace: apps
  - name: dev
    context:
      cluster: dev-cluster
      user: dev
users:
  - name: deployer
    user:
      token: abc123
  - name: dev
    user:
      tokenFile: dev-token
"#;

    #[test]
    fn test_current_context_with_token() {
        let config = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        let conn = config.connection().unwrap();
        assert_eq!(conn.server, "https://10.0.0.1:6443");
        assert_eq!(conn.ca_pem.as_deref(), Some(b"-----BEGIN CERTIFICATE-----".as_slice()));
        assert!(!conn.insecure_skip_tls_verify);
        assert!(conn.credentials == Credentials::Token("abc123".into()));
    }

    #[test]
    fn test_relative_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG.replace("current-context: prod", "current-context: dev"))
            .unwrap();
        std::fs::write(dir.path().join("dev-token"), "file-token\n").unwrap();

        let conn = Kubeconfig::from_path(&path).unwrap().connection().unwrap();
        assert!(conn.insecure_skip_tls_verify);
        assert!(conn.credentials == Credentials::Token("file-token".into()));
    }

    #[test]
    fn test_missing_context() {
        let config = Kubeconfig::from_yaml(&KUBECONFIG.replace("current-context: prod", "current-context: gone"))
            .unwrap();
        assert!(matches!(config.connection(), Err(ClusterError::Config { .. })));

        let config = Kubeconfig::from_yaml("clusters: []").unwrap();
        assert!(matches!(config.connection(), Err(ClusterError::Config { .. })));
    }

    #[test]
    fn test_client_certificate_pair_required() {
        let yaml = r#"
current-context: c
clusters: [{name: k, cluster: {server: "https://k"}}]
contexts: [{name: c, context: {cluster: k, user: u}}]
users: [{name: u, user: {client-certificate-data: Y2VydA==}}]
"#;
        let config = Kubeconfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.connection(), Err(ClusterError::Config { .. })));

        let yaml = yaml.replace("Y2VydA==}", "Y2VydA==, client-key-data: a2V5}");
        let conn = Kubeconfig::from_yaml(&yaml).unwrap().connection().unwrap();
        assert!(
            conn.credentials
                == Credentials::ClientCertificate {
                    cert_pem: b"cert".to_vec(),
                    key_pem: b"key".to_vec()
                }
        );
    }
}

//! Secret and image reference parsing.
//!
//! - `k8s://<namespace>/<secret-name>` → [`SecretRef`]
//! - `registry.example.com/team/app:1.2.0` → [`ImageRef`]

use std::fmt;
use std::str::FromStr;

use sigstore::registry::OciReference;

use crate::error::ReferenceError;

/// Scheme prefix of a Kubernetes secret reference.
pub const SECRET_REF_SCHEME: &str = "k8s://";

/// A parsed secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    /// Parse `k8s://<namespace>/<secret-name>`. The scheme prefix is optional.
    ///
    /// # Examples
    ///
    /// ```
    /// use keygate_core::SecretRef;
    ///
    /// let r = SecretRef::parse("k8s://cosign-system/cosign-keys").unwrap();
    /// assert_eq!(r.namespace, "cosign-system");
    /// assert_eq!(r.name, "cosign-keys");
    ///
    /// assert!(SecretRef::parse("k8s://only-one-part").is_err());
    /// ```
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let path = reference
            .strip_prefix(SECRET_REF_SCHEME)
            .unwrap_or(reference);

        let invalid = |reason: &str| ReferenceError::InvalidReferenceFormat {
            reference: reference.to_string(),
            reason: format!(
                "{}; expected {}<namespace>/<secret-name>",
                reason, SECRET_REF_SCHEME
            ),
        };

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Ok(Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            [_, _] => Err(invalid("namespace and secret name must be non-empty")),
            _ => Err(invalid(&format!(
                "found {} path segment(s), need exactly 2",
                parts.len()
            ))),
        }
    }
}

impl FromStr for SecretRef {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SECRET_REF_SCHEME, self.namespace, self.name)
    }
}

/// A parsed container image reference.
///
/// Thin wrapper over the registry client's reference type so that parse
/// failures surface as [`ReferenceError`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef(OciReference);

impl ImageRef {
    /// Parse `[registry/]repository[:tag][@sha256:<hex>]`.
    ///
    /// A missing registry means Docker Hub; single-component Docker Hub
    /// repositories live under `library/`.
    ///
    /// # Examples
    ///
    /// ```
    /// use keygate_core::ImageRef;
    ///
    /// let image = ImageRef::parse("ghcr.io/acme/api:1.4.2").unwrap();
    /// assert_eq!(image.registry(), "ghcr.io");
    /// assert_eq!(image.repository(), "acme/api");
    /// assert_eq!(image.tag(), Some("1.4.2"));
    ///
    /// let hub = ImageRef::parse("nginx").unwrap();
    /// assert_eq!(hub.repository(), "library/nginx");
    /// ```
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let reference = reference.trim();
        let invalid = |reason: String| ReferenceError::InvalidImageReference {
            reference: reference.to_string(),
            reason,
        };

        if reference.is_empty() {
            return Err(invalid("empty reference".to_string()));
        }
        OciReference::from_str(reference)
            .map(Self)
            .map_err(|e| invalid(e.to_string()))
    }

    /// Compose `registry/image:tag` from configuration parts.
    pub fn from_parts(registry: &str, image: &str, tag: &str) -> Result<Self, ReferenceError> {
        let registry = registry.trim().trim_end_matches('/');
        let image = image.trim().trim_matches('/');
        let tag = tag.trim();

        let composed = match (registry.is_empty(), tag.is_empty()) {
            (true, true) => image.to_string(),
            (true, false) => format!("{}:{}", image, tag),
            (false, true) => format!("{}/{}", registry, image),
            (false, false) => format!("{}/{}:{}", registry, image, tag),
        };
        Self::parse(&composed)
    }

    /// Registry host, with port if any.
    pub fn registry(&self) -> &str {
        self.0.registry()
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        self.0.repository()
    }

    pub fn tag(&self) -> Option<&str> {
        self.0.tag()
    }

    /// Pinned manifest digest.
    pub fn digest(&self) -> Option<&str> {
        self.0.digest()
    }

    pub fn oci(&self) -> &OciReference {
        &self.0
    }
}

impl FromStr for ImageRef {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry(), self.repository())?;
        if let Some(tag) = self.tag() {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = self.digest() {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

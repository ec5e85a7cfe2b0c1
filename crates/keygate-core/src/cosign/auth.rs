//! Registry credentials.
//!
//! Bearer-challenge token exchange is handled by the registry client; this
//! type only carries what the user configured.

use sigstore::registry::Auth;

/// Credentials presented to the registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,

    Basic { username: String, password: String },
}

impl RegistryAuth {
    /// Basic credentials when a non-empty username is given, otherwise anonymous.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Self {
        match username.filter(|u| !u.is_empty()) {
            Some(username) => Self::Basic {
                username,
                password: password.unwrap_or_default(),
            },
            None => Self::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl From<&RegistryAuth> for Auth {
    fn from(auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => Auth::Anonymous,
            RegistryAuth::Basic { username, password } => {
                Auth::Basic(username.clone(), password.clone())
            }
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

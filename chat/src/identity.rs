use axum::http::{HeaderMap, header::COOKIE};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the cookie the login flow stores the identity assertion in.
pub const AUTH_COOKIE: &str = "auth";

/// Verified attributes of the user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no `auth` cookie on the request")]
    Missing,
    #[error("identity assertion is not valid base64")]
    Encoding(#[from] base64::DecodeError),
    #[error("identity assertion is not a valid identity record")]
    Format(#[from] serde_json::Error),
    #[error("identity assertion carries an empty name")]
    EmptyName,
}

impl Identity {
    pub fn new(name: impl Into<String>, avatar_url: Option<String>) -> Self {
        Self {
            name: name.into(),
            avatar_url,
        }
    }

    /// Decodes the opaque assertion produced by the authentication flow: a
    /// base64 encoded JSON object with `name` and an optional `avatar_url`.
    pub fn from_assertion(blob: &str) -> Result<Self, IdentityError> {
        let raw = general_purpose::STANDARD.decode(blob.trim())?;
        let identity: Identity = serde_json::from_slice(&raw)?;
        identity.validated()
    }

    /// Encodes the identity in the same shape [`Identity::from_assertion`] reads.
    pub fn to_assertion(&self) -> String {
        // Serializing a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        general_purpose::STANDARD.encode(json)
    }

    fn validated(self) -> Result<Self, IdentityError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }

        let avatar_url = self
            .avatar_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        Ok(Self {
            name: name.to_string(),
            avatar_url,
        })
    }
}

/// Reads the identity assertion out of the request's `Cookie` headers.
pub fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, IdentityError> {
    let assertion = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.trim_matches('"'))
        .ok_or(IdentityError::Missing)?;

    Identity::from_assertion(assertion)
}

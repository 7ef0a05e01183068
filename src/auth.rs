//! Backend credential handling.
//!
//! A ComfyUI backend may sit behind a reverse proxy that requires HTTP
//! Basic auth, a bearer token, or arbitrary custom headers. The same
//! credentials are applied to REST requests and to the WebSocket
//! upgrade handshake.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Static credentials attached to a single backend.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// No authentication (direct connection).
    #[default]
    None,

    /// HTTP Basic auth (`Authorization: Basic base64(user:pass)`).
    Basic { username: String, password: String },

    /// Bearer token (`Authorization: Bearer <token>`).
    Bearer { token: String },

    /// A verbatim header map supplied by the caller.
    Custom { headers: HashMap<String, String> },
}

/// Errors raised while materialising credentials into headers.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A custom header name or value is not valid for the HTTP wire format.
    #[error("Invalid header {name:?}")]
    InvalidHeader { name: String },
}

impl Credentials {
    /// Whether any authentication is configured.
    pub fn is_configured(&self) -> bool {
        !matches!(self, Credentials::None)
    }

    /// Render the credentials as `(name, value)` header pairs.
    ///
    /// The pairs are transport-agnostic so that both the HTTP layer and
    /// the WebSocket handshake can apply them with their own header
    /// types.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        match self {
            Credentials::None => Vec::new(),
            Credentials::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                vec![("Authorization".to_string(), format!("Basic {encoded}"))]
            }
            Credentials::Bearer { token } => {
                vec![("Authorization".to_string(), format!("Bearer {token}"))]
            }
            Credentials::Custom { headers } => headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Build a [`reqwest::header::HeaderMap`] for the HTTP client.
    pub fn header_map(&self) -> Result<reqwest::header::HeaderMap, AuthError> {
        use reqwest::header::{HeaderName, HeaderValue};

        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in self.header_pairs() {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuthError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| AuthError::InvalidHeader { name: name.clone() })?;
            map.insert(header_name, header_value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_credentials_yield_no_headers() {
        assert!(Credentials::None.header_pairs().is_empty());
        assert!(!Credentials::None.is_configured());
    }

    #[test]
    fn basic_credentials_encode_user_and_password() {
        let creds = Credentials::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        let pairs = creds.header_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "Authorization");
        // base64("user:pass")
        assert_eq!(pairs[0].1, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn bearer_credentials_prefix_token() {
        let creds = Credentials::Bearer {
            token: "abc123".into(),
        };
        let pairs = creds.header_pairs();
        assert_eq!(pairs[0].1, "Bearer abc123");
    }

    #[test]
    fn custom_headers_pass_through_verbatim() {
        let mut headers = HashMap::new();
        headers.insert("X-Api-Key".to_string(), "secret".to_string());
        let creds = Credentials::Custom { headers };
        let pairs = creds.header_pairs();
        assert_eq!(pairs, vec![("X-Api-Key".to_string(), "secret".to_string())]);
    }

    #[test]
    fn invalid_custom_header_name_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_string(), "value".to_string());
        let creds = Credentials::Custom { headers };
        assert!(creds.header_map().is_err());
    }
}

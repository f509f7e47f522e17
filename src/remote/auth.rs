//! OAuth2 wire client.
//!
//! Issues the token-endpoint calls directly with `reqwest` (authorization
//! code exchange and refresh-token grant) plus the Graph profile lookup
//! used to derive the account username.  No SDK internals are patched:
//! every request is owned by this module.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use tracing::debug;

use crate::config::OAuthConfig;
use crate::errors::generate_state_token;

/// Graph endpoint returning the signed-in user's profile.
const PROFILE_URL: &str = "https://graph.microsoft.com/v1.0/me";

/// Percent-encoding set for query-string values: encode everything
/// except unreserved characters.
const QUERY_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Tokens returned by the authorization server.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime of `access_token` in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    /// Space-separated scope list, as returned by the server.
    #[serde(default)]
    pub scope: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn default_expires_in() -> u64 {
    3600
}

impl TokenSet {
    /// The granted scopes as a list.
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

/// OAuth2 client bound to one application registration.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    client: reqwest::Client,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl OAuthClient {
    /// Build a client from the `oauth` config section.
    pub fn new(config: &OAuthConfig, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            scopes: config.scopes.clone(),
        })
    }

    /// Build the user-facing authorization URL with a random `state`.
    pub fn authorize_url(&self) -> String {
        let scope = self.scopes.join(" ");
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&state={}",
            self.auth_url,
            utf8_percent_encode(&self.client_id, &QUERY_ENCODE_SET),
            utf8_percent_encode(&self.redirect_uri, &QUERY_ENCODE_SET),
            utf8_percent_encode(&scope, &QUERY_ENCODE_SET),
            generate_state_token(),
        )
    }

    /// Exchange an authorization code for a token set.
    pub async fn exchange_code(&self, auth_code: &str) -> anyhow::Result<TokenSet> {
        let scope = self.scopes.join(" ");
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("code", auth_code),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    /// Exchange a refresh token for a fresh token set.
    pub async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenSet> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> anyhow::Result<TokenSet> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("token request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("token endpoint returned {status}: {body}"));
        }

        let tokens: TokenSet = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("malformed token response: {e}"))?;

        debug!("token grant succeeded, expires_in={}", tokens.expires_in);
        Ok(tokens)
    }

    /// Look up the signed-in user's principal name.
    pub async fn fetch_username(&self, access_token: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .get(PROFILE_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("profile request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("profile endpoint returned {status}: {body}"));
        }

        let profile: serde_json::Value = resp.json().await?;
        let username = profile
            .get("userPrincipalName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("userPrincipalName missing from profile"))?
            .to_string();

        debug!("resolved account username {}", username);
        Ok(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthConfig;

    fn test_client() -> OAuthClient {
        let config = OAuthConfig {
            client_id: "my-client".to_string(),
            client_secret: "shh".to_string(),
            redirect_uri: "http://localhost:8080/auth".to_string(),
            auth_url: "https://login.example.com/authorize".to_string(),
            token_url: "https://login.example.com/token".to_string(),
            scopes: vec!["offline_access".to_string(), "Files.ReadWrite".to_string()],
        };
        OAuthClient::new(&config, 30).unwrap()
    }

    #[test]
    fn test_authorize_url_shape() {
        let url = test_client().authorize_url();
        assert!(url.starts_with("https://login.example.com/authorize?"));
        assert!(url.contains("client_id=my-client"));
        assert!(url.contains("response_type=code"));
        // Redirect URI and scopes are percent-encoded.
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fauth"));
        assert!(url.contains("scope=offline_access%20Files.ReadWrite"));
        assert!(url.contains("&state="));
    }

    #[test]
    fn test_authorize_url_fresh_state_each_call() {
        let client = test_client();
        let a = client.authorize_url();
        let b = client.authorize_url();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_set_parsing() {
        let json = r#"{
            "token_type": "Bearer",
            "scope": "offline_access Files.ReadWrite",
            "expires_in": 3600,
            "access_token": "at",
            "refresh_token": "rt"
        }"#;
        let tokens: TokenSet = serde_json::from_str(json).unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.expires_in, 3600);
        assert_eq!(
            tokens.scopes(),
            vec!["offline_access".to_string(), "Files.ReadWrite".to_string()]
        );
    }

    #[test]
    fn test_token_set_defaults() {
        // Refresh grants may omit token_type/scope; expires_in defaults.
        let tokens: TokenSet = serde_json::from_str(r#"{"access_token": "at"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, 3600);
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.scopes().is_empty());
    }
}

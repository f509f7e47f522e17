//! Account lifecycle facade over the credential store.
//!
//! Ties the OAuth wire client to the persisted account rows: login runs
//! the code exchange and profile lookup, logout and switch manipulate
//! the current-account pointer, and re-login of a known username
//! rewrites its tokens in place instead of erroring.

use std::sync::Arc;

use tracing::info;

use crate::errors::{Result, TransferError};
use crate::remote::auth::{OAuthClient, TokenSet};

use super::store::{current_timestamp, AccountRecord, SqliteCredentialStore, TokenUpdate};

/// High-level account operations backed by one store and one OAuth
/// application registration.
pub struct CredentialManager {
    store: Arc<SqliteCredentialStore>,
    oauth: OAuthClient,
}

impl CredentialManager {
    pub fn new(store: Arc<SqliteCredentialStore>, oauth: OAuthClient) -> Self {
        Self { store, oauth }
    }

    /// The URL the user visits to grant access.
    pub fn authorize_url(&self) -> String {
        self.oauth.authorize_url()
    }

    /// Complete a login from an authorization code: exchange it for
    /// tokens, resolve the account username from the user profile, and
    /// persist the account.  Returns the username.
    ///
    /// Logging in again as an already-stored username refreshes that
    /// account's tokens in place and makes it current.
    pub async fn login(&self, auth_code: &str) -> Result<String> {
        let tokens = self
            .oauth
            .exchange_code(auth_code)
            .await
            .map_err(TransferError::Internal)?;
        let username = self
            .oauth
            .fetch_username(&tokens.access_token)
            .await
            .map_err(TransferError::Internal)?;

        self.record_login(&username, &tokens)?;
        info!("logged in as {}", username);
        Ok(username)
    }

    /// Persist a completed token grant for `username`.
    fn record_login(&self, username: &str, tokens: &TokenSet) -> Result<()> {
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            TransferError::InvalidArgument {
                message: "authorization grant did not include a refresh token".to_string(),
            }
        })?;
        let expires_at = current_timestamp() + tokens.expires_in as i64;

        let record = AccountRecord {
            username: username.to_string(),
            token_type: tokens.token_type.clone(),
            expires_at,
            scopes: tokens.scopes(),
            access_token: tokens.access_token.clone(),
            refresh_token: refresh_token.clone(),
            client_id: self.oauth.client_id.clone(),
            client_secret: self.oauth.client_secret.clone(),
            auth_server_url: self.oauth.auth_url.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
        };

        match self.store.add_account(&record) {
            Ok(()) => Ok(()),
            Err(TransferError::DuplicateUsername { .. }) => {
                // Re-login: rewrite the tokens and make the account current.
                let update = TokenUpdate {
                    token_type: tokens.token_type.clone(),
                    expires_at,
                    scopes: tokens.scopes(),
                    access_token: tokens.access_token.clone(),
                    refresh_token,
                };
                self.store.update_tokens(username, &update)?;
                self.store.set_current(username)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an account.  Defaults to the current account when no
    /// username is given.  Returns whether any account remains current.
    pub fn logout(&self, username: Option<&str>) -> Result<bool> {
        let username = match username {
            Some(u) => u.to_string(),
            None => self
                .store
                .current_username()?
                .ok_or(TransferError::AccountNotFound { username: None })?,
        };
        let remains = self.store.delete_account(&username)?;
        info!("logged out {}", username);
        Ok(remains)
    }

    /// All stored usernames, ordered.
    pub fn list_accounts(&self) -> Result<Vec<String>> {
        self.store.list_accounts()
    }

    /// Username of the current account, if one is selected.
    pub fn current_username(&self) -> Result<Option<String>> {
        self.store.current_username()
    }

    /// Make `username` the current account.
    pub fn switch_account(&self, username: &str) -> Result<()> {
        self.store.set_current(username)?;
        info!("switched current account to {}", username);
        Ok(())
    }
}

//! Microsoft Graph remote store client.
//!
//! Issues the exact Graph wire calls with `reqwest`: upload session
//! creation (`createUploadSession`, conflictBehavior=rename) and
//! offset-addressed range PUTs with a `Content-Range` header.  Bearer
//! tokens come from the credential store's current account; tokens
//! within 60 seconds of expiry are refreshed (and persisted) before use.
//!
//! Remote paths are percent-encoded with `/` left intact, the same way
//! blob paths are encoded elsewhere in the Graph API.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::auth::OAuthClient;
use super::store::{CreateSessionOutcome, CreatedSession, PutRangeOutcome, RemoteStore};
use crate::credentials::store::{current_timestamp, SqliteCredentialStore, TokenUpdate};

/// Graph API base URL.
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Tokens this close to expiry are refreshed before use.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Percent-encoding set for drive item paths: encode everything except
/// unreserved characters and '/'.
const DRIVE_PATH_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Remote store client that talks to Microsoft Graph.
pub struct GraphClient {
    /// HTTP client for Graph calls.
    client: reqwest::Client,
    /// Multi-account token persistence.
    store: Arc<SqliteCredentialStore>,
    /// Token endpoint client used for refresh grants.
    oauth: OAuthClient,
}

/// Build the createUploadSession URL for a drive item path.
fn upload_session_url(remote_path: &str) -> String {
    let encoded = utf8_percent_encode(remote_path, &DRIVE_PATH_ENCODE_SET);
    format!("{GRAPH_API_BASE}/me/drive/root:{encoded}:/createUploadSession")
}

/// Format the `Content-Range` header for one committed range.
fn content_range(offset: u64, length: u64, total_length: u64) -> String {
    format!("bytes {}-{}/{}", offset, offset + length - 1, total_length)
}

/// Whether a status belongs to the transient class (retried by the
/// session): 408 plus the 5xx gateway family.
fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 500 | 502 | 503 | 504)
}

/// Pull the next expected offset out of an upload session response body
/// (`"nextExpectedRanges": ["26-"]`).
fn parse_next_expected(body: &serde_json::Value) -> Option<u64> {
    body.get("nextExpectedRanges")?
        .as_array()?
        .first()?
        .as_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

impl GraphClient {
    /// Create a Graph client over an existing credential store.
    pub fn new(
        store: Arc<SqliteCredentialStore>,
        oauth: OAuthClient,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            client,
            store,
            oauth,
        })
    }

    /// Return a valid bearer token for the current account, refreshing
    /// first when it is within the expiry margin.
    async fn bearer_token(&self) -> anyhow::Result<String> {
        let account = self.store.current_account()?;
        if account.expires_within(TOKEN_EXPIRY_MARGIN_SECS) {
            debug!(
                "access token for {} is about to expire, refreshing",
                account.username
            );
            return self.refresh_and_persist().await;
        }
        Ok(account.access_token)
    }

    /// Run a refresh grant for the current account and persist the new
    /// tokens before returning them.  Two jobs refreshing the same
    /// account concurrently resolve last-writer-wins on the stored row.
    async fn refresh_and_persist(&self) -> anyhow::Result<String> {
        let account = self.store.current_account()?;
        let tokens = self.oauth.refresh(&account.refresh_token).await?;

        let scopes = if tokens.scope.is_empty() {
            account.scopes.clone()
        } else {
            tokens.scopes()
        };
        let update = TokenUpdate {
            token_type: tokens.token_type.clone(),
            expires_at: current_timestamp() + tokens.expires_in as i64,
            scopes,
            access_token: tokens.access_token.clone(),
            // The server may rotate the refresh token; keep the old one
            // when it does not.
            refresh_token: tokens
                .refresh_token
                .unwrap_or_else(|| account.refresh_token.clone()),
        };

        // Durable before the triggering job proceeds.
        self.store.update_tokens(&account.username, &update)?;

        info!("refreshed tokens for {}", account.username);
        Ok(tokens.access_token)
    }
}

impl RemoteStore for GraphClient {
    fn create_upload_session(
        &self,
        remote_path: &str,
        total_length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CreateSessionOutcome>> + Send + '_>> {
        let remote_path = remote_path.to_string();
        Box::pin(async move {
            if !remote_path.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "remote path must start with '/': {remote_path}"
                ));
            }

            let token = self.bearer_token().await?;
            let url = upload_session_url(&remote_path);

            debug!(
                "creating upload session for {} ({} bytes)",
                remote_path, total_length
            );

            let resp = self
                .client
                .post(&url)
                .bearer_auth(token)
                .json(&serde_json::json!({
                    "item": { "@microsoft.graph.conflictBehavior": "rename" }
                }))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("createUploadSession request failed: {e}"))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                warn!("createUploadSession returned {}: {}", status, body);
                return Ok(CreateSessionOutcome::Failed {
                    status: status.as_u16(),
                    body,
                });
            }

            let body: serde_json::Value = resp.json().await?;
            let upload_url = body
                .get("uploadUrl")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("uploadUrl missing from session response"))?
                .to_string();

            Ok(CreateSessionOutcome::Created(CreatedSession { upload_url }))
        })
    }

    fn put_range(
        &self,
        upload_url: &str,
        offset: u64,
        total_length: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutRangeOutcome>> + Send + '_>> {
        let upload_url = upload_url.to_string();
        Box::pin(async move {
            let range = content_range(offset, data.len() as u64, total_length);

            let result = self
                .client
                .put(&upload_url)
                .header("Content-Range", &range)
                .header("Content-Type", "application/octet-stream")
                .body(data)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    debug!("range PUT transport failure, classified transient: {e}");
                    return Ok(PutRangeOutcome::Transient { status: None });
                }
                Err(e) => return Err(anyhow::anyhow!("range PUT failed: {e}")),
            };

            let status = resp.status();

            if status.is_success() {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let next_offset = parse_next_expected(&body);
                let item_name = body
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                return Ok(PutRangeOutcome::Accepted {
                    next_offset,
                    item_name,
                });
            }

            match status {
                StatusCode::RANGE_NOT_SATISFIABLE => Ok(PutRangeOutcome::RangeAlreadySatisfied),
                StatusCode::UNAUTHORIZED => Ok(PutRangeOutcome::AuthExpired),
                s if is_transient_status(s) => Ok(PutRangeOutcome::Transient {
                    status: Some(s.as_u16()),
                }),
                s => {
                    let body = resp.text().await.unwrap_or_default();
                    Ok(PutRangeOutcome::Rejected {
                        status: s.as_u16(),
                        body,
                    })
                }
            }
        })
    }

    fn refresh_credentials(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.refresh_and_persist().await?;
            Ok(())
        })
    }
}

//! OAuth2 client-credentials token acquisition for Microsoft Graph.

use super::TokenProvider;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

const AUTHORITY_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Confidential-client credentials for an app registration.
#[derive(Clone)]
pub struct ClientCredentials {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(
        http: reqwest::Client,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", AUTHORITY_BASE, self.tenant_id)
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    async fn acquire_token(&self) -> Result<String> {
        debug!("Requesting Graph token for tenant {}", self.tenant_id);

        let resp = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| BackupError::Authentication(format!("token request failed: {}", e)))?;

        let status = resp.status();
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackupError::Authentication(format!("unreadable token response ({}): {}", status, e)))?;

        token_from_response(body, status)
    }
}

fn token_from_response(body: TokenResponse, status: reqwest::StatusCode) -> Result<String> {
    match body.access_token {
        Some(token) if !token.is_empty() => {
            info!("Acquired Graph access token");
            Ok(token)
        }
        _ => Err(BackupError::Authentication(format!(
            "no access token in response ({}): {} {}",
            status,
            body.error.unwrap_or_default(),
            body.error_description.unwrap_or_default()
        ))),
    }
}

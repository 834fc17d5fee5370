//! HTTP implementation of the remote transaction store

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::{RemoteClient, RemoteError, RemoteResult, RemoteTransaction, TransactionPayload};
use crate::models::{OwnerId, Transaction};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for the transaction API
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl RemoteConfig {
    /// Create a config for the given API base URL.
    ///
    /// The URL must carry an http/https scheme; a trailing slash is trimmed.
    pub fn new(base_url: impl Into<String>) -> RemoteResult<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            auth_token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// reqwest-backed [`RemoteClient`]
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(config: RemoteConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn collection_url(&self, owner: &OwnerId) -> String {
        format!(
            "{}/v1/owners/{}/transactions",
            self.config.base_url,
            owner.as_str()
        )
    }

    fn record_url(&self, owner: &OwnerId, server_id: &str) -> String {
        format!("{}/{server_id}", self.collection_url(owner))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_error(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return RemoteError::NotFound(parse_api_error(status, &body));
        }
        RemoteError::Api(parse_api_error(status, &body))
    }

    async fn read_record(response: reqwest::Response) -> RemoteResult<RemoteTransaction> {
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response
            .json::<RemoteTransaction>()
            .await
            .map_err(RemoteError::from)
    }
}

impl RemoteClient for HttpRemoteClient {
    async fn create(&self, owner: &OwnerId, tx: &Transaction) -> RemoteResult<RemoteTransaction> {
        let response = self
            .authorize(self.client.post(self.collection_url(owner)))
            .json(&TransactionPayload::from_transaction(tx))
            .send()
            .await?;
        Self::read_record(response).await
    }

    async fn update(
        &self,
        owner: &OwnerId,
        server_id: &str,
        tx: &Transaction,
    ) -> RemoteResult<RemoteTransaction> {
        let response = self
            .authorize(self.client.put(self.record_url(owner, server_id)))
            .json(&TransactionPayload::from_transaction(tx))
            .send()
            .await?;
        Self::read_record(response).await
    }

    async fn delete(&self, owner: &OwnerId, server_id: &str) -> RemoteResult<()> {
        let response = self
            .authorize(self.client.delete(self.record_url(owner, server_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    async fn list(&self, owner: &OwnerId) -> RemoteResult<Vec<RemoteTransaction>> {
        let response = self
            .authorize(self.client.get(self.collection_url(owner)))
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response
            .json::<Vec<RemoteTransaction>>()
            .await
            .map_err(RemoteError::from)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RemoteError::InvalidPayload(
            "base URL must not be empty".to_string(),
        ));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidPayload(
            "base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url("https://api.example.com/".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn parse_api_error_prefers_json_message() {
        let body = r#"{"message": "owner unknown"}"#;
        assert_eq!(
            parse_api_error(StatusCode::FORBIDDEN, body),
            "owner unknown (403)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, " upstream down "),
            "upstream down (502)"
        );
    }

    #[test]
    fn record_urls_nest_under_owner() {
        let config = RemoteConfig::new("https://api.example.com/").unwrap();
        let client = HttpRemoteClient::new(config).unwrap();
        let owner = OwnerId::from("alice");
        assert_eq!(
            client.collection_url(&owner),
            "https://api.example.com/v1/owners/alice/transactions"
        );
        assert_eq!(
            client.record_url(&owner, "srv-9"),
            "https://api.example.com/v1/owners/alice/transactions/srv-9"
        );
    }
}

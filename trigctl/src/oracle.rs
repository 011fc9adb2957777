//! Permission oracle: does a developer license hold the privileges needed
//! to read a vehicle's telemetry?
//!
//! The oracle itself is an external token-exchange service; this module
//! defines the trait the evaluator depends on plus the HTTP client
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};

/// Answers `hasPermissions(asset, grantee, permissions) -> bool`.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn has_permissions(
        &self,
        asset_did: &str,
        grantee: &str,
        permissions: &[String],
    ) -> Result<bool>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionCheckRequest<'a> {
    asset_did: &'a str,
    grantee: &'a str,
    permissions: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionCheckResponse {
    has_permissions: bool,
}

/// HTTP client for the token-exchange permission service.
pub struct TokenExchangeOracle {
    http_client: reqwest::Client,
    check_url: String,
}

impl TokenExchangeOracle {
    pub fn new(check_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            check_url,
        })
    }
}

#[async_trait]
impl PermissionOracle for TokenExchangeOracle {
    async fn has_permissions(
        &self,
        asset_did: &str,
        grantee: &str,
        permissions: &[String],
    ) -> Result<bool> {
        let request = PermissionCheckRequest {
            asset_did,
            grantee,
            permissions,
        };

        let response = self
            .http_client
            .post(&self.check_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Upstream {
                service: "token-exchange",
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Upstream {
                service: "token-exchange",
                message: format!("HTTP {}", response.status()),
            });
        }

        let body: PermissionCheckResponse =
            response.json().await.map_err(|e| Error::Upstream {
                service: "token-exchange",
                message: format!("invalid response body: {e}"),
            })?;

        Ok(body.has_permissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn grants_and_denials_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .and(body_partial_json(serde_json::json!({
                "assetDid": "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7",
                "grantee": "0x0000000000000000000000000000000000000001",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hasPermissions": true
            })))
            .mount(&server)
            .await;

        let oracle = TokenExchangeOracle::new(
            format!("{}/check", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();

        let granted = oracle
            .has_permissions(
                "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7",
                "0x0000000000000000000000000000000000000001",
                &["privilege:GetNonLocationHistory".to_string()],
            )
            .await
            .unwrap();
        assert!(granted);
    }

    #[tokio::test]
    async fn non_2xx_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let oracle =
            TokenExchangeOracle::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = oracle
            .has_permissions("did:erc721:1:0xabc:1", "0xdef", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }
}

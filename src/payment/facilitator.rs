//! HTTP client for the remote payment facilitator.
//!
//! The facilitator exposes `POST /verify` and `POST /settle`; both take the
//! client's payment payload alongside the requirements derived from the
//! offer, and settle broadcasts the pre-signed transaction. The client is
//! cheap to clone and shares one `reqwest` connection pool.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;

use crate::chain::SolanaNetwork;
use crate::store::Offer;

/// Requirements in the facilitator's wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
}

impl FacilitatorRequirements {
    pub fn for_offer(offer: &Offer, network: SolanaNetwork, resource: &str) -> Self {
        Self {
            scheme: "exact".to_string(),
            network: network.as_str().to_string(),
            max_amount_required: offer.price.to_string(),
            resource: resource.to_string(),
            description: offer.description.clone().unwrap_or_default(),
            mime_type: "application/json".to_string(),
            pay_to: offer.payout_wallet.to_string(),
            max_timeout_seconds: 60,
            asset: offer.payment_token.mint_str(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: u8,
    pub payment_payload: JsonValue,
    pub payment_requirements: FacilitatorRequirements,
}

/// Settlement takes the same body as verification.
pub type SettleRequest = VerifyRequest;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}

/// Errors that can occur while talking to the facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
}

impl FacilitatorClientError {
    /// Transport-level failures may clear on retry; protocol-level answers
    /// will not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FacilitatorClientError::Http { .. }
                | FacilitatorClientError::HttpStatus {
                    status: StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT,
                    ..
                }
        )
    }
}

/// A client for the remote facilitator's `/verify` and `/settle` endpoints.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    client: Client,
    timeout: Duration,
}

impl FacilitatorClient {
    pub fn try_new(base_url: Url, timeout: Duration) -> Result<Self, FacilitatorClientError> {
        let verify_url =
            base_url
                .join("./verify")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./verify URL",
                    source: e,
                })?;
        let settle_url =
            base_url
                .join("./settle")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./settle URL",
                    source: e,
                })?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            client: Client::new(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.post_json(&self.verify_url, "POST /verify", request)
            .await
    }

    pub async fn settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.post_json(&self.settle_url, "POST /settle", request)
            .await
    }

    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let http_response = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| FacilitatorClientError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response.text().await.unwrap_or_default();
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

/// Normalizes a base URL string (single trailing slash) into a client.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> VerifyRequest {
        VerifyRequest {
            x402_version: 1,
            payment_payload: serde_json::json!({"scheme": "exact"}),
            payment_requirements: FacilitatorRequirements {
                scheme: "exact".into(),
                network: "solana".into(),
                max_amount_required: "10000".into(),
                resource: "https://proxy.example/sum".into(),
                description: "".into(),
                mime_type: "application/json".into(),
                pay_to: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
                max_timeout_seconds: 60,
                asset: "native".into(),
            },
        }
    }

    #[test]
    fn urls_derive_from_base() {
        let client = FacilitatorClient::try_from("https://facilitator.example//").unwrap();
        assert_eq!(client.verify_url.as_str(), "https://facilitator.example/verify");
        assert_eq!(client.settle_url.as_str(), "https://facilitator.example/settle");
    }

    #[tokio::test]
    async fn verify_parses_valid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isValid": true,
                "payer": "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb",
            })))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let response = client.verify(&sample_request()).await.unwrap();
        assert!(response.is_valid);
        assert_eq!(
            response.payer.as_deref(),
            Some("4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb")
        );
    }

    #[tokio::test]
    async fn settle_failure_maps_to_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let error = client.settle(&sample_request()).await.unwrap_err();
        assert!(matches!(
            error,
            FacilitatorClientError::HttpStatus {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                ..
            }
        ));
    }
}

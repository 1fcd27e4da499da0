//! Signer implementations

use crate::traits::Signer;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};
use types::{utils, AccountId, ChainCall, SignedPayload, SignerError};

/// Deterministic signer holding development keys
#[derive(Debug, Clone)]
pub struct DevSigner {
    accounts: HashSet<AccountId>,
}

impl DevSigner {
    pub fn new<I>(accounts: I) -> Self
    where
        I: IntoIterator<Item = AccountId>,
    {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }

    /// Signature the dev key of `address` produces for `call`
    pub fn signature_for(address: &AccountId, call: &ChainCall) -> String {
        let mut message = address.as_str().as_bytes().to_vec();
        message.extend(call.encode());
        format!("0x{}", hex::encode(utils::keccak256(&message)))
    }
}

#[async_trait]
impl Signer for DevSigner {
    async fn sign(&self, address: &AccountId, call: &ChainCall) -> Result<SignedPayload, SignerError> {
        if !self.accounts.contains(address) {
            return Err(SignerError::UnknownAccount(address.to_string()));
        }

        debug!(signer = %address, call = call.label(), "Signing with dev key");
        Ok(SignedPayload {
            signer: address.clone(),
            call: call.clone(),
            signature: Self::signature_for(address, call),
        })
    }

    fn name(&self) -> &str {
        "dev"
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    address: &'a AccountId,
    call: &'a ChainCall,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

/// Delegates signing to an external wallet bridge
#[derive(Debug, Clone)]
pub struct HttpSigner {
    base_url: String,
    http_client: Client,
}

impl HttpSigner {
    /// Create a signer posting to `{base_url}/sign`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SignerError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent("plan-executor/0.1.0")
            .build()
            .map_err(|e| SignerError::Remote(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Signer for HttpSigner {
    async fn sign(&self, address: &AccountId, call: &ChainCall) -> Result<SignedPayload, SignerError> {
        let url = format!("{}/sign", self.base_url);
        info!(signer = %address, call = call.label(), "Requesting signature from wallet bridge");

        let response = self
            .http_client
            .post(&url)
            .json(&SignRequest { address, call })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SignerError::Timeout
                } else {
                    SignerError::Remote(format!("request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(SignerError::Remote(format!(
                "wallet bridge returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| SignerError::Remote(format!("invalid response: {}", e)))?;

        if body.signature.is_empty() {
            return Err(SignerError::Remote("empty signature".to_string()));
        }

        Ok(SignedPayload {
            signer: address.clone(),
            call: call.clone(),
            signature: body.signature,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn remark() -> ChainCall {
        ChainCall::Remark {
            data: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dev_signer_is_deterministic() {
        let signer = DevSigner::new(vec![AccountId::from("alice")]);
        let a = signer.sign(&"alice".into(), &remark()).await.unwrap();
        let b = signer.sign(&"alice".into(), &remark()).await.unwrap();
        assert_eq!(a.signature, b.signature);
        assert!(a.signature.starts_with("0x"));

        let err = signer.sign(&"bob".into(), &remark()).await.unwrap_err();
        assert!(matches!(err, SignerError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn test_http_signer_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sign"))
            .and(body_partial_json(serde_json::json!({ "address": "alice" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "signature": "0xdeadbeef"
            })))
            .mount(&mock_server)
            .await;

        let signer = HttpSigner::new(format!("{}/", mock_server.uri()), Duration::from_secs(5)).unwrap();
        let signed = signer.sign(&"alice".into(), &remark()).await.unwrap();

        assert_eq!(signed.signature, "0xdeadbeef");
        assert_eq!(signed.signer, AccountId::from("alice"));
    }

    #[tokio::test]
    async fn test_http_signer_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let signer = HttpSigner::new(mock_server.uri(), Duration::from_secs(5)).unwrap();
        let err = signer.sign(&"alice".into(), &remark()).await.unwrap_err();
        assert!(matches!(err, SignerError::Remote(_)));
    }

    #[tokio::test]
    async fn test_http_signer_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "signature": "0x01" }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let signer = HttpSigner::new(mock_server.uri(), Duration::from_millis(50)).unwrap();
        let err = signer.sign(&"alice".into(), &remark()).await.unwrap_err();
        assert!(matches!(err, SignerError::Timeout));
    }
}

//! HTTP implementation of the wallet backend gateway.
//!
//! Every call except register and login carries the bearer credential.
//! Non-success statuses are classified by [`classify_failure`]; nothing is
//! retried here.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use super::{classify_failure, parse_token, RemoteGateway};
use crate::api::types::{
    GenerateQrRequest, GeneratedQr, LoginRequest, PayQrRequest, ProfileResponse, RegisterRequest,
    RegistrationReceipt, ServerReceipt, TopUpRequest, TransferRequest, UserSummary,
    WalletSnapshot,
};
use crate::config_store::NetworkConfig;
use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> WalletResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            WalletError::NetworkError(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(HttpGateway {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &NetworkConfig) -> WalletResult<Self> {
        Self::new(&config.api_base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, credential: &SecretString) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .bearer_auth(credential.expose_secret())
    }

    fn post(&self, path: &str, credential: Option<&SecretString>) -> RequestBuilder {
        let request = self.client.post(self.url(path));
        match credential {
            Some(credential) => request.bearer_auth(credential.expose_secret()),
            None => request,
        }
    }

    /// Send a request and return the raw body of a 2xx response.
    async fn send_raw(&self, path: &str, request: RequestBuilder) -> WalletResult<Zeroizing<String>> {
        let response = request.send().await?;
        let status = response.status();
        let body = Zeroizing::new(response.text().await?);
        log::debug!("{} -> {}", path, status.as_u16());

        if !status.is_success() {
            let error = classify_failure(status.as_u16(), &body);
            log::warn!("Request to {} failed: {}", path, error);
            return Err(error);
        }
        Ok(body)
    }

    async fn send<T: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> WalletResult<T> {
        let body = self.send_raw(path, request).await?;
        serde_json::from_str(&body).map_err(|e| {
            WalletError::InvalidResponse(format!("Unexpected response from {}: {}", path, e))
        })
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn register(&self, request: &RegisterRequest) -> WalletResult<RegistrationReceipt> {
        const PATH: &str = "/api/auth/register";
        let body = self.send_raw(PATH, self.post(PATH, None).json(request)).await?;
        Ok(serde_json::from_str(&body)
            .unwrap_or_else(|_| RegistrationReceipt::Message(body.trim().to_string())))
    }

    async fn login(&self, request: &LoginRequest) -> WalletResult<SecretString> {
        const PATH: &str = "/api/auth/login";
        let body = self.send_raw(PATH, self.post(PATH, None).json(request)).await?;
        parse_token(&body)
    }

    async fn profile(&self, credential: &SecretString) -> WalletResult<ProfileResponse> {
        const PATH: &str = "/api/auth/profile";
        self.send(PATH, self.get(PATH, credential)).await
    }

    async fn list_users(&self, credential: &SecretString) -> WalletResult<Vec<UserSummary>> {
        const PATH: &str = "/api/auth/users";
        self.send(PATH, self.get(PATH, credential)).await
    }

    async fn top_up(
        &self,
        credential: &SecretString,
        request: &TopUpRequest,
    ) -> WalletResult<WalletSnapshot> {
        const PATH: &str = "/api/wallet/topup";
        self.send(PATH, self.post(PATH, Some(credential)).json(request))
            .await
    }

    async fn transfer(
        &self,
        credential: &SecretString,
        request: &TransferRequest,
    ) -> WalletResult<ServerReceipt> {
        const PATH: &str = "/api/wallet/transfer";
        self.send(PATH, self.post(PATH, Some(credential)).json(request))
            .await
    }

    async fn generate_qr(
        &self,
        credential: &SecretString,
        request: &GenerateQrRequest,
    ) -> WalletResult<GeneratedQr> {
        const PATH: &str = "/api/qr/generate";
        self.send(PATH, self.post(PATH, Some(credential)).json(request))
            .await
    }

    async fn pay_qr(
        &self,
        credential: &SecretString,
        request: &PayQrRequest,
    ) -> WalletResult<ServerReceipt> {
        const PATH: &str = "/api/qr/pay";
        self.send(PATH, self.post(PATH, Some(credential)).json(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::LoginRequest;

    #[test]
    fn base_url_is_normalized() {
        let gateway = HttpGateway::new("http://localhost:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.base_url(), "http://localhost:8080");
        assert_eq!(
            gateway.url("/api/auth/profile"),
            "http://localhost:8080/api/auth/profile"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let gateway = HttpGateway::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let request = LoginRequest {
            email: "asha@example.com".to_string(),
            password: SecretString::from("secret1".to_string()),
        };
        let err = gateway.login(&request).await.unwrap_err();
        assert!(matches!(err, WalletError::NetworkError(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    #[ignore] // Requires the hosted backend to be reachable
    async fn test_live_profile_rejects_bogus_token() {
        let gateway = HttpGateway::from_config(&NetworkConfig::default()).unwrap();
        let result = gateway
            .profile(&SecretString::from("not-a-real-token".to_string()))
            .await;
        assert!(matches!(result, Err(WalletError::AuthError(_))));
    }
}

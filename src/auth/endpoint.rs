use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{header, Client as HttpClient};
use serde::Deserialize;

use crate::config::ServiceConfig;

/// A successful response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// The three OAuth grants this layer uses against the token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// App identity: client-credentials grant. No refresh token is issued.
    async fn client_credentials(&self) -> Result<TokenGrant>;

    /// User identity: exchange a one-time authorization code.
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    /// User identity: rebuild an access token from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Token endpoint over HTTPS with Basic `client_id:client_secret` auth.
pub struct HttpTokenEndpoint {
    http: HttpClient,
    token_url: String,
    redirect_uri: String,
    basic_auth: String,
}

impl HttpTokenEndpoint {
    pub fn new(http: HttpClient, service: &ServiceConfig) -> Self {
        let basic_auth = general_purpose::STANDARD
            .encode(format!("{}:{}", service.client_id, service.client_secret));

        Self {
            http,
            token_url: service.token_url.clone(),
            redirect_uri: service.redirect_uri.clone(),
            basic_auth,
        }
    }

    async fn post_grant(&self, params: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.token_url)
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", self.basic_auth),
            )
            .form(params)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<TokenGrant>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!(
                "Token endpoint returned {}: {}",
                status,
                body
            ))
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn client_credentials(&self) -> Result<TokenGrant> {
        self.post_grant(&[("grant_type", "client_credentials")]).await
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.post_grant(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.post_grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

//! HTTP client implementation

use reqwest::{header, Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::errors::DeployerError;

/// HTTP client for the record API
pub struct HttpClient {
    client: Client,
    base_url: Url,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str) -> Result<Self, DeployerError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        // A trailing slash makes relative joins append instead of replace
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Send a bearer token with every request
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path relative to the base URL
    pub fn url(&self, path: &str) -> Result<Url, DeployerError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeployerError> {
        self.send::<T, ()>(Method::GET, path, None).await
    }

    /// Make a PATCH request
    pub async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DeployerError> {
        self.send(Method::PATCH, path, Some(body)).await
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, DeployerError> {
        let url = self.url(path)?;
        debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(token) = &self.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DeployerError::NotFound(url.path().to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} failed: {} - {}", method, status, body);
            return Err(DeployerError::StorageError(format!("{}: {}", status, body)));
        }

        let body = response.json().await?;
        Ok(body)
    }
}

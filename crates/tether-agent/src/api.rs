//! Control-service HTTP API
//!
//! All four calls the agent makes to the control service go through
//! [`ControlApi`], so credential issuance and the poll transport can be
//! exercised against a mock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use tracing::debug;

use tether_common::protocol::{ConfirmRequest, RegisterRequest, RegisterResponse};
use tether_common::{ConfigOverlay, Error, Result, AUTH_TOKEN_HEADER};

/// Calls made to the control service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Register a freshly generated public key; expects 201
    async fn register(&self, instance_id: &str, request: &RegisterRequest)
        -> Result<RegisterResponse>;

    /// Confirm a received token; expects 200
    async fn confirm(&self, instance_id: &str, token: &str, request: &ConfirmRequest)
        -> Result<()>;

    /// Fetch the latest overlay; 404 means no overlay published yet
    async fn fetch_overlay(&self, instance_id: &str, token: &str) -> Result<ConfigOverlay>;

    /// Upload a stats report; expects 201
    async fn post_stats(&self, instance_id: &str, token: &str, body: Vec<u8>) -> Result<()>;
}

/// Shared control API handle
pub type SharedControlApi = Arc<dyn ControlApi>;

/// [`ControlApi`] over HTTPS
pub struct HttpControlApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpControlApi {
    /// Client for the API rooted at `endpoint` (e.g. `https://api.example.com/api/v1/instance`)
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::http("client", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, instance_id: &str, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, instance_id, path)
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn register(
        &self,
        instance_id: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse> {
        let url = self.url(instance_id, "register");
        debug!(url = %url, "Registering instance");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::http("register", e.to_string()))?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(Error::http_status(
                "register",
                status.as_u16(),
                "could not register instance",
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Error::http("register", format!("invalid response: {}", e)))
    }

    async fn confirm(
        &self,
        instance_id: &str,
        token: &str,
        request: &ConfirmRequest,
    ) -> Result<()> {
        let url = self.url(instance_id, "confirm");
        debug!(url = %url, serial = request.serial, "Confirming instance token");

        let response = self
            .client
            .post(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::http("confirm", e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::http_status(
                "confirm",
                status.as_u16(),
                "token confirmation rejected",
            ));
        }
        Ok(())
    }

    async fn fetch_overlay(&self, instance_id: &str, token: &str) -> Result<ConfigOverlay> {
        let url = self.url(instance_id, "config/overlay");

        let response = self
            .client
            .get(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .header("x-scal-request-id", uuid::Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| Error::http("overlay", e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::http("overlay", e.to_string()))?;
                Ok(ConfigOverlay::from_slice(&bytes)?)
            }
            StatusCode::NOT_FOUND => Ok(ConfigOverlay::empty()),
            other => Err(Error::http_status(
                "overlay",
                other.as_u16(),
                "access forbidden",
            )),
        }
    }

    async fn post_stats(&self, instance_id: &str, token: &str, body: Vec<u8>) -> Result<()> {
        let url = self.url(instance_id, "stats");

        let response = self
            .client
            .post(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::http("stats", e.to_string()))?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status("stats", status.as_u16(), body));
        }
        Ok(())
    }
}

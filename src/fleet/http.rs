//! HTTPS implementation of the fleet API
//!
//! Every cluster endpoint serves the same REST surface under `/api/v1`:
//! `GET readyz`, `POST instances`, and `GET/PUT/DELETE instances/{name}`.
//! One reqwest client carrying the operator's TLS identity is shared by all
//! cluster connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Response, StatusCode, Url};
use tracing::debug;

use super::{FleetClient, FleetConnector, FleetError, FleetInstance, ReadyStatus};
use crate::crd::InstanceConfig;

/// Default request timeout against a fleet endpoint
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS material shared by every cluster connection
#[derive(Clone, Debug, Default)]
pub struct TlsMaterial {
    /// CA certificate PEM used to verify fleet endpoints
    pub ca_cert_pem: Option<String>,
    /// Client certificate PEM
    pub client_cert_pem: Option<String>,
    /// Client private key PEM
    pub client_key_pem: Option<String>,
    /// Skip server certificate verification
    pub insecure: bool,
}

/// [`FleetConnector`] over HTTPS
pub struct HttpFleetConnector {
    client: Client,
}

impl HttpFleetConnector {
    /// Build the shared HTTP client from the TLS material
    pub fn new(tls: &TlsMaterial, timeout: Duration) -> Result<Self, FleetError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(tls.insecure);

        if let Some(ca) = &tls.ca_cert_pem {
            let cert = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| FleetError::Tls(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        match (&tls.client_cert_pem, &tls.client_key_pem) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.as_bytes().to_vec();
                pem.push(b'\n');
                pem.extend_from_slice(key.as_bytes());
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| FleetError::Tls(format!("invalid client identity: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(FleetError::Tls(
                    "client certificate and key must be provided together".to_string(),
                ))
            }
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl FleetConnector for HttpFleetConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn FleetClient>, FleetError> {
        let base = api_base(endpoint)?;
        debug!(%base, "connecting to fleet");
        Ok(Arc::new(HttpFleetClient {
            client: self.client.clone(),
            base,
        }))
    }
}

/// One fleet endpoint
pub struct HttpFleetClient {
    client: Client,
    base: Url,
}

impl HttpFleetClient {
    fn url(&self, path: &str) -> Result<Url, FleetError> {
        self.base
            .join(path)
            .map_err(|e| FleetError::Connect(format!("invalid path {path}: {e}")))
    }
}

#[async_trait]
impl FleetClient for HttpFleetClient {
    async fn ready_status(&self) -> Result<ReadyStatus, FleetError> {
        let resp = self.client.get(self.url("readyz")?).send().await?;
        Ok(success(resp).await?.json().await?)
    }

    async fn get_instance(&self, name: &str) -> Result<Option<FleetInstance>, FleetError> {
        let resp = self
            .client
            .get(self.url(&format!("instances/{name}"))?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(success(resp).await?.json().await?))
    }

    async fn create_instance(&self, config: &InstanceConfig) -> Result<FleetInstance, FleetError> {
        let resp = self
            .client
            .post(self.url("instances")?)
            .json(config)
            .send()
            .await?;
        Ok(success(resp).await?.json().await?)
    }

    async fn modify_instance(&self, config: &InstanceConfig) -> Result<FleetInstance, FleetError> {
        let resp = self
            .client
            .put(self.url(&format!("instances/{}", config.name))?)
            .json(config)
            .send()
            .await?;
        Ok(success(resp).await?.json().await?)
    }

    async fn delete_instance(&self, name: &str) -> Result<(), FleetError> {
        let resp = self
            .client
            .delete(self.url(&format!("instances/{name}"))?)
            .send()
            .await?;
        success(resp).await?;
        Ok(())
    }
}

fn api_base(endpoint: &str) -> Result<Url, FleetError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FleetError::Connect("cluster has no endpoint".to_string()));
    }

    let url = Url::parse(&format!("{trimmed}/api/v1/"))
        .map_err(|e| FleetError::Connect(format!("invalid endpoint {endpoint:?}: {e}")))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(FleetError::Connect(format!(
            "unsupported endpoint scheme {other:?}"
        ))),
    }
}

async fn success(resp: Response) -> Result<Response, FleetError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(FleetError::Api {
        status: status.as_u16(),
        message,
    })
}

//! FlexLB fleet management API
//!
//! The operator drives remote load balancers through two seams:
//! - [`FleetConnector`] turns a cluster endpoint into a connected client,
//!   holding the operator-wide TLS material
//! - [`FleetClient`] is one connected cluster: readiness plus instance CRUD
//!
//! [`http`] implements both over HTTPS. Handlers only see the traits, so
//! tests substitute mocks.

pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::InstanceConfig;

pub use http::{HttpFleetConnector, TlsMaterial};

/// Per FlexLB node status, keyed by node id
pub type ReadyStatus = BTreeMap<String, String>;

/// Errors returned by the fleet API
#[derive(Debug, Error)]
pub enum FleetError {
    /// TLS material could not be loaded
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// Endpoint unusable or unreachable
    #[error("connect error: {0}")]
    Connect(String),

    /// Transport failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response
    #[error("api error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
}

/// An instance as stored on the fleet
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FleetInstance {
    /// Active configuration
    pub config: InstanceConfig,
    /// Per FlexLB node status of this instance
    #[serde(default)]
    pub status: ReadyStatus,
}

/// Creates clients for FlexLB cluster endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetConnector: Send + Sync {
    /// Connect to the management endpoint of one cluster
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn FleetClient>, FleetError>;
}

/// A connected FlexLB cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Readiness of every FlexLB node
    async fn ready_status(&self) -> Result<ReadyStatus, FleetError>;

    /// Fetch an instance, `None` if the fleet does not know it
    async fn get_instance(&self, name: &str) -> Result<Option<FleetInstance>, FleetError>;

    /// Create an instance from its configuration
    async fn create_instance(&self, config: &InstanceConfig) -> Result<FleetInstance, FleetError>;

    /// Replace the configuration of an existing instance
    async fn modify_instance(&self, config: &InstanceConfig) -> Result<FleetInstance, FleetError>;

    /// Delete an instance
    async fn delete_instance(&self, name: &str) -> Result<(), FleetError>;
}

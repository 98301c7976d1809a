//! Handlers and reconcile entry points for the FlexLB controllers
//!
//! Each event kind has its own capability trait, all implemented by the one
//! [`Context`] that holds the shared dependencies:
//!
//! - [`ClusterChanged`] - connect to a FlexLB cluster and refresh its status
//! - [`InstanceChanged`] / [`InstanceDeleted`] - drive a remote instance
//! - [`NodeChanged`] - discover a node's traffic networks
//! - [`ServiceChanged`] / [`ServiceDeleted`] - bind a Service to an instance
//!
//! Handlers assume the caller holds [`Context::guard`]. The `reconcile`
//! functions in the submodules take it before calling into a handler, and
//! handlers call each other freely while it is held.

mod cluster;
mod instance;
mod node;
mod service;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource};

use crate::crd::{FlexLBCluster, FlexLBInstance};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::fleet::{FleetClient, FleetConnector, HttpFleetConnector, TlsMaterial};
use crate::guard::SerializationGuard;
use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::probe::ProbeSettings;
use crate::{Error, DEFAULT_NAMESPACE, DEFAULT_REFRESH_INTERVAL_SECS};

pub use cluster::{error_policy as cluster_error_policy, reconcile as reconcile_cluster};
pub use instance::{error_policy as instance_error_policy, reconcile as reconcile_instance};
pub use node::{error_policy as node_error_policy, reconcile as reconcile_node};
pub use service::{error_policy as service_error_policy, reconcile as reconcile_service};

/// Requeue delay after a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Capabilities
// =============================================================================

/// A FlexLBCluster changed, or an instance needs its cluster
#[async_trait]
pub trait ClusterChanged {
    /// Connect to the cluster and write its readiness to its status.
    ///
    /// The status is written on failure too, as not-ready.
    async fn cluster_changed(&self, cluster: &FlexLBCluster) -> Result<Arc<dyn FleetClient>, Error>;
}

/// A FlexLBInstance changed or is due for its periodic re-check
#[async_trait]
pub trait InstanceChanged {
    /// Converge the remote instance on the declared config
    async fn instance_changed(&self, instance: &FlexLBInstance) -> Result<(), Error>;
}

/// A FlexLBInstance is being deleted
#[async_trait]
pub trait InstanceDeleted {
    /// Remove the remote instance where possible and release the finalizer
    async fn instance_deleted(&self, instance: &FlexLBInstance) -> Result<(), Error>;
}

/// A Node changed
#[async_trait]
pub trait NodeChanged {
    /// Discover and record the node's traffic networks if not known yet
    async fn node_changed(&self, node: &Node) -> Result<(), Error>;
}

/// A Service or one of its EndpointSlices changed
#[async_trait]
pub trait ServiceChanged {
    /// Create or update the Service's instance and report its address
    async fn service_changed(&self, service: &Service) -> Result<(), Error>;
}

/// A Service is being deleted or stopped being a LoadBalancer
#[async_trait]
pub trait ServiceDeleted {
    /// Delete the bound instance and release the Service
    async fn service_deleted(&self, service: &Service) -> Result<(), Error>;
}

// =============================================================================
// Context
// =============================================================================

/// Shared dependencies of every handler
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .namespace("kube-system")
///     .tls(tls)
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes API access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Factory for FlexLB cluster clients
    pub fleet: Arc<dyn FleetConnector>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Lock held by every mutating handler
    pub guard: SerializationGuard,
    /// Namespace holding FlexLBClusters
    pub namespace: String,
    /// Periodic re-check interval of instances and clusters
    pub refresh_interval: Duration,
    /// Node probe settings
    pub probe: ProbeSettings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Publish a Normal event on `obj`
    pub(crate) async fn normal<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Normal, reason, action, Some(note))
            .await;
    }

    /// Publish a Warning event describing `error` on `obj`
    pub(crate) async fn warning<K>(&self, obj: &K, error: &Error, action: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.warning_with(obj, error.reason(), action, error.to_string())
            .await;
    }

    /// Publish a Warning event with an explicit reason on `obj`
    pub(crate) async fn warning_with<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Warning, reason, action, Some(note))
            .await;
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        fleet: Arc<dyn FleetConnector>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            fleet,
            events,
            guard: SerializationGuard::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            probe: ProbeSettings::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    fleet: Option<Arc<dyn FleetConnector>>,
    events: Option<Arc<dyn EventPublisher>>,
    tls: TlsMaterial,
    fleet_timeout: Duration,
    namespace: String,
    refresh_interval: Duration,
    probe: ProbeSettings,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            fleet: None,
            events: None,
            tls: TlsMaterial::default(),
            fleet_timeout: crate::fleet::http::DEFAULT_REQUEST_TIMEOUT,
            namespace: DEFAULT_NAMESPACE.to_string(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            probe: ProbeSettings::default(),
        }
    }

    /// Set the namespace of FlexLBClusters and probe pods
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self.probe.namespace = self.namespace.clone();
        self
    }

    /// Set the periodic re-check interval
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the node probe image and timing; the namespace is kept
    pub fn probe(mut self, probe: ProbeSettings) -> Self {
        self.probe = ProbeSettings {
            namespace: self.probe.namespace,
            ..probe
        };
        self
    }

    /// Set the TLS material used for every FlexLB cluster
    pub fn tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = tls;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the fleet connector (primarily for testing)
    pub fn fleet_connector(mut self, fleet: Arc<dyn FleetConnector>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context. Fails when the TLS material is unusable.
    pub fn build(self) -> Result<Context, Error> {
        let fleet = match self.fleet {
            Some(fleet) => fleet,
            None => Arc::new(HttpFleetConnector::new(&self.tls, self.fleet_timeout)?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            fleet,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone()))),
            guard: SerializationGuard::new(),
            namespace: self.namespace,
            refresh_interval: self.refresh_interval,
            probe: self.probe,
        })
    }
}

/// Requeue retryable failures; wait for a change on terminal ones
fn requeue_on(error: &Error) -> Action {
    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

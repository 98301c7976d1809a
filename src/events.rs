//! Kubernetes Event recording for the FlexLB controllers.
//!
//! Handlers report every failure as an Event on the affected object so that
//! `kubectl describe` shows why a Service has no external address yet.
//! Publishing is fire-and-forget: a failed Event is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Reporting component name on every Event
pub const CONTROLLER_NAME: &str = "flexlb-kube-controller";

/// Publishes Kubernetes Events on FlexLB-managed objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object.
    ///
    /// `reason` is the machine-readable code shown in the REASON column,
    /// `note` the human-readable message.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as [`CONTROLLER_NAME`]
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason codes.
pub mod reasons {
    /// Cluster or pool missing, or frontend outside its pool
    pub const ERROR_INVALID_CONFIG: &str = "ErrorInvalidConfig";
    /// FlexLB cluster unreachable or not reporting readiness
    pub const ERROR_CLUSTER_NOT_READY: &str = "ErrorClusterNotReady";
    /// Remote instance exists but no node is up
    pub const ERROR_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
    /// Fleet rejected a modify
    pub const ERROR_INSTANCE_MODIFY_FAILED: &str = "ErrorInstanceModifyFailed";
    /// Fleet rejected a create
    pub const ERROR_INSTANCE_CREATE_FAILED: &str = "ErrorInstanceCreateFailed";
    /// Remote delete failed; the local object is released anyway
    pub const ERROR_INSTANCE_DELETE_FAILED: &str = "ErrorInstanceDeleteFailed";
    /// Node traffic network discovery failed
    pub const ERROR_PROBE_TRAFFIC_NODE_IP: &str = "ErrorProbeTrafficNodeIp";
    /// Node traffic network annotation could not be written
    pub const ERROR_UPDATE_TRAFFIC_NODE_IP: &str = "ErrorUpdateTrafficNodeIp";
    /// Pool missing or exhausted
    pub const ERROR_NO_IP_POOL: &str = "ErrorNoIPPool";
    /// No backend resolvable on the traffic network
    pub const ERROR_NO_BACKENDS: &str = "ErrorNoBackends";
    /// Kubernetes API call failed
    pub const ERROR_KUBERNETES_API: &str = "ErrorKubernetesApi";

    /// Remote instance created
    pub const INSTANCE_CREATED: &str = "InstanceCreated";
    /// Remote instance reconfigured
    pub const INSTANCE_MODIFIED: &str = "InstanceModified";
    /// Instance removed, remotely and locally
    pub const INSTANCE_DELETED: &str = "InstanceDeleted";
    /// Service bound to an instance and given its external address
    pub const BALANCER_BOUND: &str = "BalancerBound";
    /// Service released its instance
    pub const BALANCER_UNBOUND: &str = "BalancerUnbound";
    /// Node traffic networks recorded
    pub const NODE_NETWORK_DISCOVERED: &str = "NodeNetworkDiscovered";
}

/// Event action codes.
pub mod actions {
    /// Standard reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a remote instance
    pub const CREATE: &str = "Create";
    /// Modifying a remote instance
    pub const MODIFY: &str = "Modify";
    /// Deleting an instance
    pub const DELETE: &str = "Delete";
    /// Probing a node
    pub const PROBE: &str = "Probe";
    /// Binding a Service
    pub const BIND: &str = "Bind";
}

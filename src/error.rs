//! Error types for the FlexLB operator

use thiserror::Error;

use crate::fleet::FleetError;

/// Main error type for FlexLB operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Referenced cluster or pool is missing, or the instance frontend no longer fits its pool
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Connecting to a FlexLB cluster or reading its readiness failed
    #[error("cluster {cluster} not ready: {source}")]
    ClusterNotReady {
        /// Name of the FlexLBCluster
        cluster: String,
        /// Underlying fleet failure
        source: FleetError,
    },

    /// The fleet rejected an instance create
    #[error("instance {instance} create failed: {source}")]
    InstanceCreateFailed {
        /// Remote instance name
        instance: String,
        /// Underlying fleet failure
        source: FleetError,
    },

    /// The fleet rejected an instance modify
    #[error("instance {instance} modify failed: {source}")]
    InstanceModifyFailed {
        /// Remote instance name
        instance: String,
        /// Underlying fleet failure
        source: FleetError,
    },

    /// A fleet call outside create/modify failed
    #[error("fleet error: {0}")]
    Fleet(#[from] FleetError),

    /// The remote instance exists but no node reports it up
    #[error("instance {0} not ready")]
    InstanceNotReady(String),

    /// Node network discovery failed
    #[error("probe of node {node} failed: {reason}")]
    ProbeFailed {
        /// Node that was probed
        node: String,
        /// Exit reason, timeout or parse failure
        reason: String,
    },

    /// Every address of an IP pool is already allocated
    #[error("ip range {start}-{end} exhausted")]
    RangeExhausted {
        /// First address of the range
        start: String,
        /// Last address of the range
        end: String,
    },

    /// The IP pool referenced by a Service does not exist on its cluster
    #[error("ip pool {pool} not found on cluster {cluster}")]
    NoIPPool {
        /// Cluster name
        cluster: String,
        /// Pool name
        pool: String,
    },

    /// A Service has no backend that can be reached on the traffic network
    #[error("service {0} has no resolvable backend endpoints")]
    NoBackends(String),

    /// Node traffic network annotation could not be written
    #[error("failed to update traffic network of node {node}: {reason}")]
    NodeAnnotation {
        /// Node name
        node: String,
        /// Underlying failure
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Validation error for resource contents
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create an invalid config error with the given message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a probe failure for the given node
    pub fn probe_failed(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether requeueing the object can make progress without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_)
            | Self::ClusterNotReady { .. }
            | Self::InstanceCreateFailed { .. }
            | Self::InstanceModifyFailed { .. }
            | Self::Fleet(_)
            | Self::InstanceNotReady(_)
            | Self::ProbeFailed { .. }
            | Self::NoBackends(_)
            | Self::NodeAnnotation { .. }
            | Self::RangeExhausted { .. }
            | Self::NoIPPool { .. } => true,
            Self::InvalidConfig(_)
            | Self::Serialization(_)
            | Self::Validation(_) => false,
        }
    }

    /// Event reason recorded on the affected object
    pub fn reason(&self) -> &'static str {
        use crate::events::reasons;

        match self {
            Self::InvalidConfig(_) | Self::Validation(_) | Self::Serialization(_) => {
                reasons::ERROR_INVALID_CONFIG
            }
            Self::ClusterNotReady { .. } | Self::Fleet(_) => reasons::ERROR_CLUSTER_NOT_READY,
            Self::InstanceCreateFailed { .. } => reasons::ERROR_INSTANCE_CREATE_FAILED,
            Self::InstanceModifyFailed { .. } => reasons::ERROR_INSTANCE_MODIFY_FAILED,
            Self::InstanceNotReady(_) => reasons::ERROR_INSTANCE_NOT_READY,
            Self::ProbeFailed { .. } => reasons::ERROR_PROBE_TRAFFIC_NODE_IP,
            Self::NodeAnnotation { .. } => reasons::ERROR_UPDATE_TRAFFIC_NODE_IP,
            Self::RangeExhausted { .. } | Self::NoIPPool { .. } => reasons::ERROR_NO_IP_POOL,
            Self::NoBackends(_) => reasons::ERROR_NO_BACKENDS,
            Self::Kube(_) => reasons::ERROR_KUBERNETES_API,
        }
    }
}

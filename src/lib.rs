//! FlexLB operator - external load balancers for Kubernetes LoadBalancer Services
//!
//! The operator watches LoadBalancer Services and provisions one FlexLB
//! instance per Service on an external FlexLB fleet. The Service gets the
//! instance's frontend address as its ingress IP; backends are the Service's
//! node ports reached over a dedicated traffic network.
//!
//! # Architecture
//!
//! - A Service change synthesizes the desired backend topology and creates or
//!   updates a FlexLBInstance next to the Service
//! - The instance controller drives the remote instance on its FlexLBCluster
//!   and re-checks it on a fixed interval to catch remote drift
//! - A Node without a traffic network annotation is probed with a short-lived
//!   host-network pod that dumps its routes
//! - Every mutating handler runs under one process-wide lock, which is what
//!   makes scan-then-allocate of frontend addresses safe
//!
//! # Modules
//!
//! - [`crd`] - FlexLBCluster and FlexLBInstance resources
//! - [`controller`] - Handlers and reconcile entry points
//! - [`controller_runner`] - kube-rs controller wiring
//! - [`fleet`] - FlexLB management API client
//! - [`ipam`] - Frontend address allocation
//! - [`probe`] - Node traffic network discovery
//! - [`guard`] - Serialization of mutating handlers
//! - [`kube_client`] - Kubernetes API access used by the handlers
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Command line and environment configuration
//! - [`retry`] - Backoff for startup calls
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod controller_runner;
pub mod crd;
pub mod error;
pub mod events;
pub mod fleet;
pub mod guard;
pub mod ipam;
pub mod kube_client;
pub mod probe;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Annotation, label and finalizer keys
// =============================================================================

/// Service annotation / instance label: owning FlexLBCluster
pub const CLUSTER_KEY: &str = "flexlb.gitee.io/cluster";

/// Service annotation / instance label: IP pool on the owning cluster
pub const IPPOOL_KEY: &str = "flexlb.gitee.io/ippool";

/// Service annotation: bound FlexLBInstance
pub const INSTANCE_KEY: &str = "flexlb.gitee.io/instance";

/// Instance annotation: owning Service
pub const SERVICE_KEY: &str = "flexlb.gitee.io/service";

/// Node annotation: JSON list of discovered traffic networks
pub const NODE_NETWORK_KEY: &str = "flexlb.gitee.io/nodeNetwork";

/// Finalizer held on managed Services and on instances
pub const FINALIZER: &str = "flexlb.gitee.io/finalizer";

/// Label linking an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Field manager for every write
pub const FIELD_MANAGER: &str = "flexlb-kube-controller";

// =============================================================================
// Defaults
// =============================================================================

/// Cluster used when a Service or instance names none
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Pool used when a Service or instance names none
pub const DEFAULT_IPPOOL_NAME: &str = "default";

/// Namespace holding FlexLBClusters and probe pods
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Interval at which instances and clusters are re-checked
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Image of the node probe pod
pub const DEFAULT_PROBE_IMAGE: &str = "busybox";

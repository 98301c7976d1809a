//! Custom Resource Definitions for FlexLB
//!
//! Both kinds share the `crd.flexlb.gitee.io/v1` API group.

mod cluster;
mod instance;

pub use cluster::{ClusterReadiness, FlexLBCluster, FlexLBClusterSpec, FlexLBClusterStatus, IPPool};
pub use instance::{
    BackendServer, Endpoint, EndpointMode, FlexLBInstance, FlexLBInstanceSpec,
    FlexLBInstanceStatus, InstanceConfig, InstancePhase, DEFAULT_BACKEND_SERVER_OPTIONS,
    DEFAULT_BALANCE, NODE_STATUS_UP,
};

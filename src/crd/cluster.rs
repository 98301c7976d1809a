//! FlexLBCluster Custom Resource Definition
//!
//! A FlexLBCluster describes one FlexLB fleet: the management endpoint the
//! operator talks to and the IP pools frontends are allocated from. Clusters
//! live in the operator namespace.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::instance::InstanceConfig;
use crate::ipam;

/// Specification for a FlexLBCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crd.flexlb.gitee.io",
    version = "v1",
    kind = "FlexLBCluster",
    plural = "flexlbclusters",
    shortname = "flc",
    status = "FlexLBClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.cluster_status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct FlexLBClusterSpec {
    /// Management API endpoint, e.g. `https://10.10.0.5:8443`
    #[serde(default)]
    pub endpoint: String,

    /// Frontend address pools, looked up by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ippools: Vec<IPPool>,
}

impl FlexLBClusterSpec {
    /// Find a pool by name
    pub fn ippool(&self, name: &str) -> Option<&IPPool> {
        self.ippools.iter().find(|p| p.name == name)
    }
}

/// A named range of frontend addresses on one interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct IPPool {
    /// Pool name, referenced by Services through the ippool annotation
    pub name: String,
    /// Interface on the FlexLB nodes that carries the frontend address
    pub interface: String,
    /// Prefix length of frontend addresses
    pub net_prefix: u8,
    /// First allocatable address
    pub start: String,
    /// Last allocatable address (inclusive)
    pub end: String,
    /// Network (CIDR) over which FlexLB reaches the Kubernetes nodes
    pub backend_network: String,
}

impl IPPool {
    /// Whether an instance frontend fits this pool: same interface, same
    /// prefix length and an address inside `[start, end]`.
    pub fn matches(&self, config: &InstanceConfig) -> bool {
        self.interface == config.frontend_interface
            && self.net_prefix == config.frontend_net_prefix
            && ipam::in_range(&config.frontend_ipaddress, &self.start, &self.end)
    }
}

/// Reachability of a FlexLB cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterReadiness {
    /// Management endpoint answered with a readiness snapshot
    Ready,
    /// Connect or readiness fetch failed
    #[default]
    NotReady,
}

impl fmt::Display for ClusterReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady => write!(f, "not_ready"),
        }
    }
}

/// Status for a FlexLBCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FlexLBClusterStatus {
    /// Overall readiness
    #[serde(default)]
    pub cluster_status: ClusterReadiness,

    /// Per FlexLB node readiness as last reported by the fleet
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_status: BTreeMap<String, String>,
}

impl FlexLBClusterStatus {
    /// Ready status carrying the fleet's node snapshot
    pub fn ready(node_status: BTreeMap<String, String>) -> Self {
        Self {
            cluster_status: ClusterReadiness::Ready,
            node_status,
        }
    }

    /// Not-ready status; the node snapshot is dropped since it is stale
    pub fn not_ready() -> Self {
        Self::default()
    }
}

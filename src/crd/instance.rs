//! FlexLBInstance Custom Resource Definition
//!
//! A FlexLBInstance is one load balancer on a FlexLB cluster: a frontend
//! address taken from an IP pool plus the backend servers behind each
//! frontend port. Instances are created next to their Service and carry the
//! service back-reference annotation.
//!
//! [`InstanceConfig`] is also the body exchanged with the fleet API, so its
//! field names follow the fleet's snake_case wire format.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CLUSTER_NAME, DEFAULT_IPPOOL_NAME};

/// Balancing algorithm applied to every endpoint
pub const DEFAULT_BALANCE: &str = "roundrobin";

/// Health-check and limit options applied to every backend server
pub const DEFAULT_BACKEND_SERVER_OPTIONS: &str =
    "inter 2s downinter 5s rise 2 fall 2 slowstart 60s maxconn 2000 maxqueue 2000 weight 100 check";

/// Node status value reported by the fleet for a serving node
pub const NODE_STATUS_UP: &str = "up";

/// Specification for a FlexLBInstance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crd.flexlb.gitee.io",
    version = "v1",
    kind = "FlexLBInstance",
    plural = "flexlbinstances",
    shortname = "fli",
    status = "FlexLBInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Frontend","type":"string","jsonPath":".spec.config.frontend_ipaddress"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct FlexLBInstanceSpec {
    /// Owning FlexLBCluster, `default` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// IP pool on the owning cluster, `default` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ippool: Option<String>,

    /// Desired remote configuration
    #[serde(default)]
    pub config: InstanceConfig,
}

impl FlexLBInstanceSpec {
    /// Effective cluster name
    pub fn cluster_name(&self) -> &str {
        self.cluster
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CLUSTER_NAME)
    }

    /// Effective pool name
    pub fn ippool_name(&self) -> &str {
        self.ippool
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_IPPOOL_NAME)
    }
}

/// Remote instance configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Remote instance name, equal to the FlexLBInstance name
    #[serde(default)]
    pub name: String,
    /// Interface the frontend address is plumbed on
    #[serde(default)]
    pub frontend_interface: String,
    /// Prefix length of the frontend address
    #[serde(default)]
    pub frontend_net_prefix: u8,
    /// Frontend (external) address
    #[serde(default)]
    pub frontend_ipaddress: String,
    /// One entry per frontend port
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Transport of a frontend port
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// TCP proxying
    Tcp,
    /// UDP proxying
    Udp,
}

impl EndpointMode {
    /// Map a Kubernetes port protocol; SCTP and unknown values are unsupported
    pub fn from_protocol(protocol: Option<&str>) -> Option<Self> {
        match protocol.unwrap_or("TCP") {
            "TCP" => Some(Self::Tcp),
            "UDP" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// One frontend port and its backend servers
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Endpoint {
    /// Port on the frontend address
    pub frontend_port: u16,
    /// Transport
    pub mode: EndpointMode,
    /// Balancing algorithm
    #[serde(default)]
    pub balance: String,
    /// Extra backend section options
    #[serde(default)]
    pub backend_options: Vec<String>,
    /// Options applied to every backend server
    #[serde(default)]
    pub backend_default_server: String,
    /// Backend servers, one per resolvable endpoint
    #[serde(default)]
    pub backend_servers: Vec<BackendServer>,
}

impl Endpoint {
    /// Endpoint with the fixed balancing and health-check settings
    pub fn new(frontend_port: u16, mode: EndpointMode, backend_servers: Vec<BackendServer>) -> Self {
        Self {
            frontend_port,
            mode,
            balance: DEFAULT_BALANCE.to_string(),
            backend_options: Vec::new(),
            backend_default_server: DEFAULT_BACKEND_SERVER_OPTIONS.to_string(),
            backend_servers,
        }
    }
}

/// A backend target: a node traffic address and the Service node port
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BackendServer {
    /// Name of the backing object (usually the pod)
    pub name: String,
    /// Node address on the traffic network
    pub ipaddress: String,
    /// Node port
    pub port: u16,
}

/// Instance lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Owning cluster unreachable
    ClusterNotReady,
    /// Remote instance created
    Created,
    /// Remote create rejected
    CreateFailed,
    /// Remote instance reconfigured
    Modified,
    /// Remote modify rejected; previous remote config still active
    ModifyFailed,
    /// At least one FlexLB node reports the instance up
    Ready,
    /// No FlexLB node reports the instance up
    NotReady,
}

impl InstancePhase {
    /// Phase derived from the fleet's per-node status of an unchanged instance
    pub fn from_node_status(node_status: &BTreeMap<String, String>) -> Self {
        if node_status.values().any(|s| s == NODE_STATUS_UP) {
            Self::Ready
        } else {
            Self::NotReady
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClusterNotReady => "cluster_not_ready",
            Self::Created => "created",
            Self::CreateFailed => "create_failed",
            Self::Modified => "modified",
            Self::ModifyFailed => "modify_failed",
            Self::Ready => "ready",
            Self::NotReady => "not_ready",
        };
        write!(f, "{s}")
    }
}

/// Status for a FlexLBInstance
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FlexLBInstanceStatus {
    /// Lifecycle phase
    pub phase: InstancePhase,

    /// Per FlexLB node status (`up`, `down`, `pending`)
    #[serde(default)]
    pub node_status: BTreeMap<String, String>,
}

impl FlexLBInstanceStatus {
    /// Status with the given phase and no node snapshot
    pub fn with_phase(phase: InstancePhase) -> Self {
        Self {
            phase,
            node_status: BTreeMap::new(),
        }
    }

    /// Attach the fleet's node snapshot
    pub fn node_status(mut self, node_status: BTreeMap<String, String>) -> Self {
        self.node_status = node_status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_empty_references_fall_back_to_default() {
        let spec = FlexLBInstanceSpec::default();
        assert_eq!(spec.cluster_name(), "default");
        assert_eq!(spec.ippool_name(), "default");

        let spec = FlexLBInstanceSpec {
            cluster: Some(String::new()),
            ippool: Some("dmz".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.cluster_name(), "default");
        assert_eq!(spec.ippool_name(), "dmz");
    }

    #[test]
    fn protocols_map_to_modes() {
        assert_eq!(EndpointMode::from_protocol(None), Some(EndpointMode::Tcp));
        assert_eq!(EndpointMode::from_protocol(Some("TCP")), Some(EndpointMode::Tcp));
        assert_eq!(EndpointMode::from_protocol(Some("UDP")), Some(EndpointMode::Udp));
        assert_eq!(EndpointMode::from_protocol(Some("SCTP")), None);
    }

    #[test]
    fn endpoints_carry_fixed_settings() {
        let ep = Endpoint::new(80, EndpointMode::Tcp, vec![]);
        assert_eq!(ep.balance, "roundrobin");
        assert!(ep.backend_default_server.ends_with("weight 100 check"));
        assert!(ep.backend_options.is_empty());
    }

    #[test]
    fn phase_follows_node_status() {
        let mut nodes = BTreeMap::from([
            ("lb-1".to_string(), "down".to_string()),
            ("lb-2".to_string(), "pending".to_string()),
        ]);
        assert_eq!(InstancePhase::from_node_status(&nodes), InstancePhase::NotReady);
        assert_eq!(
            InstancePhase::from_node_status(&BTreeMap::new()),
            InstancePhase::NotReady
        );

        nodes.insert("lb-3".to_string(), "up".to_string());
        assert_eq!(InstancePhase::from_node_status(&nodes), InstancePhase::Ready);
    }

    #[test]
    fn phases_serialize_like_their_display() {
        for phase in [
            InstancePhase::ClusterNotReady,
            InstancePhase::Created,
            InstancePhase::CreateFailed,
            InstancePhase::Modified,
            InstancePhase::ModifyFailed,
            InstancePhase::Ready,
            InstancePhase::NotReady,
        ] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, serde_json::Value::String(phase.to_string()));
        }
    }

    #[test]
    fn remote_config_with_missing_lists_equals_local() {
        let remote: InstanceConfig = serde_json::from_value(serde_json::json!({
            "name": "web-ab12",
            "frontend_interface": "eth0",
            "frontend_net_prefix": 24,
            "frontend_ipaddress": "10.0.0.10",
            "endpoints": [{
                "frontend_port": 80,
                "mode": "tcp",
                "balance": "roundrobin",
                "backend_default_server": DEFAULT_BACKEND_SERVER_OPTIONS,
                "backend_servers": [{"name": "web-0", "ipaddress": "192.168.10.4", "port": 30080}]
            }]
        }))
        .unwrap();

        let local = InstanceConfig {
            name: "web-ab12".to_string(),
            frontend_interface: "eth0".to_string(),
            frontend_net_prefix: 24,
            frontend_ipaddress: "10.0.0.10".to_string(),
            endpoints: vec![Endpoint::new(
                80,
                EndpointMode::Tcp,
                vec![BackendServer {
                    name: "web-0".to_string(),
                    ipaddress: "192.168.10.4".to_string(),
                    port: 30080,
                }],
            )],
        };
        assert_eq!(remote, local);
    }
}

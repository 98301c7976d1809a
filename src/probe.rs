//! Node traffic network discovery
//!
//! FlexLB reaches Service backends through node ports on a dedicated
//! traffic network, so the operator needs each node's address on that
//! network. It finds them by running a short-lived pod on the node's host
//! network that prints `<network> <device> <ip>` for every connected route.
//!
//! One discovery attempt:
//! 1. delete a leftover probe pod of an aborted attempt and wait for it to go
//! 2. create the probe pod pinned to the node
//! 3. poll the pod until it terminates or the timeout passes
//! 4. read and parse its log on success
//! 5. delete the pod, whatever happened
//!
//! The wait is driven by [`tokio::time`], so tests run it on a paused clock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Toleration};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::kube_client::KubeClient;
use crate::{Error, DEFAULT_NAMESPACE, DEFAULT_PROBE_IMAGE, FIELD_MANAGER};

/// Prints one `<network> <device> <src ip>` line per connected route
pub const ROUTE_COMMAND: &str =
    r#"ip route | awk '$2=="dev"{for(i=3;i<NF;i++) if($i=="src"){print $1,$3,$(i+1); break}}'"#;

const PROBE_CONTAINER: &str = "probe";

/// One traffic network a node is attached to
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkDescriptor {
    /// Network in CIDR form, compared against an IP pool's backend network
    pub network: String,
    /// Interface carrying the network
    pub device: String,
    /// The node's address on the network
    pub ip_address: String,
}

/// Where and how probe pods run
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    /// Namespace of the probe pods
    pub namespace: String,
    /// Image providing `sh`, `ip` and `awk`
    pub image: String,
    /// Interval between pod status reads
    pub poll_interval: Duration,
    /// Give up on a pod that has not terminated after this long
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_PROBE_IMAGE.to_string(),
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Observed state of a probe pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbePhase {
    /// Not scheduled or not started yet
    Pending,
    /// Container running
    Running,
    /// Terminated with exit code 0
    Succeeded,
    /// Terminated with a non-zero exit code
    Failed {
        /// Container termination reason and exit code
        reason: String,
    },
    /// Did not terminate within the timeout
    TimedOut,
}

impl ProbePhase {
    /// Map a pod (or its absence) to a phase
    pub fn observe(pod: Option<&Pod>) -> Self {
        let Some(status) = pod.and_then(|p| p.status.as_ref()) else {
            return Self::Pending;
        };

        let terminated = status
            .container_statuses
            .as_ref()
            .and_then(|cs| cs.iter().find(|c| c.name == PROBE_CONTAINER))
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.terminated.as_ref());

        if let Some(t) = terminated {
            if t.exit_code == 0 {
                return Self::Succeeded;
            }
            let reason = t.reason.as_deref().unwrap_or("Error");
            return Self::Failed {
                reason: format!("{reason} (exit code {})", t.exit_code),
            };
        }

        match status.phase.as_deref() {
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed {
                reason: status
                    .reason
                    .clone()
                    .or_else(|| status.message.clone())
                    .unwrap_or_else(|| "pod failed".to_string()),
            },
            Some("Running") => Self::Running,
            _ => Self::Pending,
        }
    }

    /// Whether polling can stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::TimedOut)
    }
}

/// Name of the probe pod for a node
pub fn probe_pod_name(node: &str) -> String {
    format!("flexlb-node-probe-{node}")
}

/// Probe pod pinned to `node` on its host network
pub fn probe_pod(node: &str, settings: &ProbeSettings) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(probe_pod_name(node)),
            namespace: Some(settings.namespace.clone()),
            labels: Some(BTreeMap::from([
                (
                    "app.kubernetes.io/name".to_string(),
                    "flexlb-node-probe".to_string(),
                ),
                (
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            // must run on tainted nodes too, or their backends stay unresolved
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: PROBE_CONTAINER.to_string(),
                image: Some(settings.image.clone()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    ROUTE_COMMAND.to_string(),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// Parse probe output. Lines that are not exactly three fields ending in an
/// IP address are skipped.
pub fn parse_routes(output: &str) -> Vec<NetworkDescriptor> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [network, device, ip] = fields.as_slice() else {
                return None;
            };
            ip.parse::<IpAddr>().ok()?;
            Some(NetworkDescriptor {
                network: network.to_string(),
                device: device.to_string(),
                ip_address: ip.to_string(),
            })
        })
        .collect()
}

/// Address of a node on `network`, read from its traffic network annotation
pub fn traffic_ip<'a>(descriptors: &'a [NetworkDescriptor], network: &str) -> Option<&'a str> {
    descriptors
        .iter()
        .find(|d| d.network == network)
        .map(|d| d.ip_address.as_str())
}

/// Run one discovery attempt against `node`.
///
/// The whole attempt, including waiting out a leftover pod, shares one
/// deadline of `settings.timeout`. The probe pod is deleted before returning
/// on every path.
pub async fn discover(
    kube: &dyn KubeClient,
    settings: &ProbeSettings,
    node: &str,
) -> Result<Vec<NetworkDescriptor>, Error> {
    let name = probe_pod_name(node);
    let namespace = settings.namespace.as_str();
    let deadline = Instant::now() + settings.timeout;

    kube.delete_pod(namespace, &name).await?;
    wait_until_gone(kube, settings, node, &name, deadline).await?;

    debug!(node, pod = %name, "creating probe pod");
    kube.create_pod(namespace, &probe_pod(node, settings)).await?;

    let result = collect(kube, settings, node, &name, deadline).await;

    if let Err(e) = kube.delete_pod(namespace, &name).await {
        warn!(node, pod = %name, error = %e, "failed to delete probe pod");
    }

    if let Ok(ref networks) = result {
        info!(node, count = networks.len(), "discovered node networks");
    }
    result
}

async fn collect(
    kube: &dyn KubeClient,
    settings: &ProbeSettings,
    node: &str,
    name: &str,
    deadline: Instant,
) -> Result<Vec<NetworkDescriptor>, Error> {
    match wait_for_termination(kube, settings, name, deadline).await? {
        ProbePhase::Succeeded => {
            let output = kube.pod_logs(&settings.namespace, name).await?;
            let networks = parse_routes(&output);
            if networks.is_empty() {
                return Err(Error::probe_failed(node, "probe reported no routes"));
            }
            Ok(networks)
        }
        ProbePhase::Failed { reason } => Err(Error::probe_failed(node, reason)),
        ProbePhase::TimedOut => Err(Error::probe_failed(
            node,
            format!("probe pod did not finish within {:?}", settings.timeout),
        )),
        phase => Err(Error::probe_failed(
            node,
            format!("probe stopped in non-terminal phase {phase:?}"),
        )),
    }
}

/// Poll the probe pod until it terminates or the deadline passes
async fn wait_for_termination(
    kube: &dyn KubeClient,
    settings: &ProbeSettings,
    name: &str,
    deadline: Instant,
) -> Result<ProbePhase, Error> {
    loop {
        let pod = kube.get_pod(&settings.namespace, name).await?;
        let phase = ProbePhase::observe(pod.as_ref());
        if phase.is_terminal() {
            return Ok(phase);
        }
        if Instant::now() >= deadline {
            return Ok(ProbePhase::TimedOut);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

/// Wait for a deleted probe pod to disappear so its name can be reused
async fn wait_until_gone(
    kube: &dyn KubeClient,
    settings: &ProbeSettings,
    node: &str,
    name: &str,
    deadline: Instant,
) -> Result<(), Error> {
    while kube.get_pod(&settings.namespace, name).await?.is_some() {
        if Instant::now() >= deadline {
            return Err(Error::probe_failed(
                node,
                format!("previous probe pod {name} is still terminating"),
            ));
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
    Ok(())
}

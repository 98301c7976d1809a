//! Node reconciliation: traffic network discovery
//!
//! A node is probed once. The result is stored in its traffic network
//! annotation, and removing the annotation triggers a new probe.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::{requeue_on, Context, NodeChanged};
use crate::events::{actions, reasons};
use crate::kube_client::is_deleting;
use crate::probe::{self, NetworkDescriptor};
use crate::{Error, NODE_NETWORK_KEY};

#[async_trait]
impl NodeChanged for Context {
    async fn node_changed(&self, node: &Node) -> Result<(), Error> {
        let name = node.name_any();
        if node.annotations().contains_key(NODE_NETWORK_KEY) {
            debug!(node = %name, "traffic networks already known");
            return Ok(());
        }

        let networks = probe::discover(self.kube.as_ref(), &self.probe, &name).await?;
        let value = encode(&networks)?;
        self.kube
            .set_node_annotation(&name, NODE_NETWORK_KEY, &value)
            .await
            .map_err(|e| Error::NodeAnnotation {
                node: name.clone(),
                reason: e.to_string(),
            })?;

        info!(node = %name, networks = %value, "recorded node traffic networks");
        self.normal(
            node,
            reasons::NODE_NETWORK_DISCOVERED,
            actions::PROBE,
            format!("Discovered {} traffic network(s)", networks.len()),
        )
        .await;
        Ok(())
    }
}

/// Serialized form stored in the node annotation
pub(crate) fn encode(networks: &[NetworkDescriptor]) -> Result<String, Error> {
    serde_json::to_string(networks).map_err(|e| Error::serialization(e.to_string()))
}

/// Read the traffic networks recorded on a node. A malformed annotation reads
/// as no networks.
pub(crate) fn recorded_networks(node: &Node) -> Option<Vec<NetworkDescriptor>> {
    let raw = node.annotations().get(NODE_NETWORK_KEY)?;
    serde_json::from_str(raw).ok()
}

/// Whether the kubelet reports the node Ready
fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Reconcile a Node
///
/// Probe pods cannot run on a node that is going away or not Ready; such
/// nodes are picked up by the event that makes them Ready.
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, Error> {
    if is_deleting(node.as_ref()) || !is_ready(&node) {
        debug!("skipping node that cannot run a probe");
        return Ok(Action::await_change());
    }
    if node.annotations().contains_key(NODE_NETWORK_KEY) {
        return Ok(Action::await_change());
    }

    let _permit = ctx.guard.enter("node_changed", node.name_any()).await;

    match ctx.node_changed(&node).await {
        Ok(()) => Ok(Action::await_change()),
        Err(e) => {
            ctx.warning(node.as_ref(), &e, actions::PROBE).await;
            Err(e)
        }
    }
}

/// Error policy for the node controller
pub fn error_policy(node: Arc<Node>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        node = %node.name_any(),
        "reconciliation failed"
    );
    requeue_on(error)
}

//! FlexLBCluster reconciliation
//!
//! Connecting to a cluster is shared with the instance handlers: every
//! instance operation starts with [`ClusterChanged::cluster_changed`], so a
//! cluster's status reflects the last time anything talked to it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::{requeue_on, ClusterChanged, Context};
use crate::crd::{ClusterReadiness, FlexLBCluster, FlexLBClusterStatus};
use crate::events::actions;
use crate::fleet::{FleetClient, FleetError, ReadyStatus};
use crate::Error;

#[async_trait]
impl ClusterChanged for Context {
    async fn cluster_changed(&self, cluster: &FlexLBCluster) -> Result<Arc<dyn FleetClient>, Error> {
        let name = cluster.name_any();

        match connect(self, &cluster.spec.endpoint).await {
            Ok((client, ready)) => {
                debug!(cluster = %name, nodes = ready.len(), "cluster ready");
                write_status(self, cluster, FlexLBClusterStatus::ready(ready)).await?;
                Ok(client)
            }
            Err(source) => {
                warn!(cluster = %name, error = %source, "cluster not ready");
                if let Err(e) = write_status(self, cluster, FlexLBClusterStatus::not_ready()).await {
                    warn!(cluster = %name, error = %e, "failed to record cluster status");
                }
                Err(Error::ClusterNotReady {
                    cluster: name,
                    source,
                })
            }
        }
    }
}

async fn connect(
    ctx: &Context,
    endpoint: &str,
) -> Result<(Arc<dyn FleetClient>, ReadyStatus), FleetError> {
    let client = ctx.fleet.connect(endpoint).await?;
    let ready = client.ready_status().await?;
    Ok((client, ready))
}

/// Write the status unless it is already current
async fn write_status(
    ctx: &Context,
    cluster: &FlexLBCluster,
    status: FlexLBClusterStatus,
) -> Result<(), Error> {
    if cluster.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    ctx.kube
        .patch_cluster_status(&namespace, &cluster.name_any(), &status)
        .await?;
    if status.cluster_status == ClusterReadiness::Ready {
        info!(cluster = %cluster.name_any(), "cluster status updated to ready");
    }
    Ok(())
}

/// Reconcile a FlexLBCluster: refresh its readiness on every change and on
/// the refresh interval
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<FlexLBCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let _permit = ctx.guard.enter("cluster_changed", cluster.name_any()).await;

    match ctx.cluster_changed(&cluster).await {
        Ok(_) => Ok(Action::requeue(ctx.refresh_interval)),
        Err(e) => {
            ctx.warning(cluster.as_ref(), &e, actions::RECONCILE).await;
            Err(e)
        }
    }
}

/// Error policy for the cluster controller
pub fn error_policy(cluster: Arc<FlexLBCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    requeue_on(error)
}

//! FlexLBInstance reconciliation
//!
//! The instance handler converges one remote FlexLB instance on its
//! declared config. A broken binding (Service gone or bound elsewhere,
//! cluster or pool gone, frontend outside its pool) deletes the instance
//! instead of retrying; the Service handler creates a fresh one on its next
//! pass.
//!
//! Phases:
//!
//! ```text
//! cluster_not_ready -> created | create_failed
//! created | modified -> ready | not_ready     (from remote node status)
//! not_ready -> modified                      (after a successful modify)
//! any -> modify_failed                       (remote keeps the old config)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::{requeue_on, ClusterChanged, Context, InstanceChanged, InstanceDeleted};
use crate::crd::{FlexLBInstance, FlexLBInstanceStatus, InstanceConfig, InstancePhase};
use crate::events::{actions, reasons};
use crate::fleet::FleetClient;
use crate::kube_client::{has_finalizer, is_deleting};
use crate::{Error, FINALIZER, INSTANCE_KEY, SERVICE_KEY};

#[async_trait]
impl InstanceChanged for Context {
    async fn instance_changed(&self, instance: &FlexLBInstance) -> Result<(), Error> {
        let name = instance.name_any();
        let namespace = instance.namespace().unwrap_or_default();

        if let Some(reason) = orphaned(self, instance).await? {
            return discard(self, instance, reason).await;
        }

        let cluster_name = instance.spec.cluster_name();
        let ippool_name = instance.spec.ippool_name();
        let Some(cluster) = self.kube.get_cluster(&self.namespace, cluster_name).await? else {
            return discard(self, instance, format!("cluster {cluster_name} does not exist")).await;
        };
        let Some(pool) = cluster.spec.ippool(ippool_name) else {
            return discard(
                self,
                instance,
                format!("ip pool {ippool_name} does not exist on cluster {cluster_name}"),
            )
            .await;
        };
        if !pool.matches(&instance.spec.config) {
            return discard(
                self,
                instance,
                format!(
                    "frontend {}/{} on {} does not fit ip pool {ippool_name}",
                    instance.spec.config.frontend_ipaddress,
                    instance.spec.config.frontend_net_prefix,
                    instance.spec.config.frontend_interface,
                ),
            )
            .await;
        }

        let client = match self.cluster_changed(&cluster).await {
            Ok(client) => client,
            Err(e) => {
                let status = FlexLBInstanceStatus::with_phase(InstancePhase::ClusterNotReady);
                if let Err(write) = write_status(self, instance, status).await {
                    warn!(instance = %name, error = %write, "failed to record instance status");
                }
                return Err(e);
            }
        };

        let desired = desired_config(instance);
        let remote = client.get_instance(&name).await?;

        match remote {
            None => create(self, client.as_ref(), instance, &desired).await?,
            Some(remote) if remote.config == desired => {
                let phase = InstancePhase::from_node_status(&remote.status);
                let status = FlexLBInstanceStatus::with_phase(phase).node_status(remote.status);
                write_status(self, instance, status).await?;
                if phase == InstancePhase::NotReady {
                    return Err(Error::InstanceNotReady(name));
                }
                debug!(instance = %name, namespace = %namespace, "instance in sync");
            }
            Some(_) => modify(self, client.as_ref(), instance, &desired).await?,
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceDeleted for Context {
    async fn instance_deleted(&self, instance: &FlexLBInstance) -> Result<(), Error> {
        let name = instance.name_any();
        let namespace = instance.namespace().unwrap_or_default();

        if has_finalizer(instance, FINALIZER) {
            delete_remote(self, instance).await;
            self.kube
                .remove_instance_finalizer(&namespace, &name, FINALIZER)
                .await?;
        }

        info!(instance = %name, namespace = %namespace, "instance deleted");
        self.normal(
            instance,
            reasons::INSTANCE_DELETED,
            actions::DELETE,
            format!("Deleted instance {name}"),
        )
        .await;
        Ok(())
    }
}

/// Why the instance no longer belongs to a Service, if it does not.
///
/// The binding is only valid while the Service names this instance back; an
/// instance left behind by an interrupted bind would otherwise hold its
/// address and remote load balancer forever.
async fn orphaned(ctx: &Context, instance: &FlexLBInstance) -> Result<Option<String>, Error> {
    let Some(service) = instance.annotations().get(SERVICE_KEY) else {
        return Ok(Some(format!("missing {SERVICE_KEY} annotation")));
    };
    let namespace = instance.namespace().unwrap_or_default();
    let Some(svc) = ctx.kube.get_service(&namespace, service).await? else {
        return Ok(Some(format!("service {service} does not exist")));
    };
    let name = instance.name_any();
    match svc.annotations().get(INSTANCE_KEY) {
        Some(bound) if *bound == name => Ok(None),
        Some(bound) => Ok(Some(format!("service {service} is bound to instance {bound}"))),
        None => Ok(Some(format!("service {service} is not bound to an instance"))),
    }
}

/// Delete an instance whose binding can no longer be satisfied
async fn discard(ctx: &Context, instance: &FlexLBInstance, reason: String) -> Result<(), Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    warn!(instance = %name, namespace = %namespace, %reason, "deleting instance with invalid binding");

    ctx.warning(instance, &Error::invalid_config(reason), actions::DELETE)
        .await;
    ctx.kube.delete_instance(&namespace, &name).await
}

/// Declared config as sent to the fleet; the remote name is the resource name
fn desired_config(instance: &FlexLBInstance) -> InstanceConfig {
    InstanceConfig {
        name: instance.name_any(),
        ..instance.spec.config.clone()
    }
}

async fn create(
    ctx: &Context,
    client: &dyn FleetClient,
    instance: &FlexLBInstance,
    desired: &InstanceConfig,
) -> Result<(), Error> {
    let name = instance.name_any();
    match client.create_instance(desired).await {
        Ok(created) => {
            let status =
                FlexLBInstanceStatus::with_phase(InstancePhase::Created).node_status(created.status);
            write_status(ctx, instance, status).await?;
            refresh_labels(ctx, instance).await?;
            info!(instance = %name, frontend = %desired.frontend_ipaddress, "remote instance created");
            ctx.normal(
                instance,
                reasons::INSTANCE_CREATED,
                actions::CREATE,
                format!("Created instance {name} at {}", desired.frontend_ipaddress),
            )
            .await;
            Ok(())
        }
        Err(source) => {
            write_status(
                ctx,
                instance,
                FlexLBInstanceStatus::with_phase(InstancePhase::CreateFailed),
            )
            .await?;
            Err(Error::InstanceCreateFailed {
                instance: name,
                source,
            })
        }
    }
}

async fn modify(
    ctx: &Context,
    client: &dyn FleetClient,
    instance: &FlexLBInstance,
    desired: &InstanceConfig,
) -> Result<(), Error> {
    let name = instance.name_any();
    match client.modify_instance(desired).await {
        Ok(modified) => {
            let status = FlexLBInstanceStatus::with_phase(InstancePhase::Modified)
                .node_status(modified.status);
            write_status(ctx, instance, status).await?;
            refresh_labels(ctx, instance).await?;
            info!(instance = %name, "remote instance modified");
            ctx.normal(
                instance,
                reasons::INSTANCE_MODIFIED,
                actions::MODIFY,
                format!("Modified instance {name}"),
            )
            .await;
            Ok(())
        }
        Err(source) => {
            // Keep the last node snapshot: the old remote config is still serving.
            let node_status = instance
                .status
                .as_ref()
                .map(|s| s.node_status.clone())
                .unwrap_or_default();
            let status = FlexLBInstanceStatus::with_phase(InstancePhase::ModifyFailed)
                .node_status(node_status);
            write_status(ctx, instance, status).await?;
            Err(Error::InstanceModifyFailed {
                instance: name,
                source,
            })
        }
    }
}

/// Best-effort removal of the remote instance. Never fails: an unreachable
/// cluster must not keep the resource around forever.
async fn delete_remote(ctx: &Context, instance: &FlexLBInstance) {
    let name = instance.name_any();
    let cluster_name = instance.spec.cluster_name();

    let cluster = match ctx.kube.get_cluster(&ctx.namespace, cluster_name).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => {
            debug!(instance = %name, cluster = %cluster_name, "cluster gone, nothing to delete remotely");
            return;
        }
        Err(e) => {
            warn!(instance = %name, error = %e, "failed to read cluster, skipping remote delete");
            return;
        }
    };

    let client = match ctx.cluster_changed(&cluster).await {
        Ok(client) => client,
        Err(e) => {
            warn!(instance = %name, error = %e, "cluster unreachable, skipping remote delete");
            return;
        }
    };

    let result = match client.get_instance(&name).await {
        Ok(Some(_)) => client.delete_instance(&name).await,
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(instance = %name, error = %e, "remote delete failed");
        ctx.warning_with(
            instance,
            reasons::ERROR_INSTANCE_DELETE_FAILED,
            actions::DELETE,
            format!("Failed to delete remote instance {name}: {e}"),
        )
        .await;
    }
}

/// Keep the allocation scan labels in step with the spec
async fn refresh_labels(ctx: &Context, instance: &FlexLBInstance) -> Result<(), Error> {
    let cluster = instance.spec.cluster_name();
    let ippool = instance.spec.ippool_name();
    let labels = instance.labels();
    if labels.get(crate::CLUSTER_KEY).map(String::as_str) == Some(cluster)
        && labels.get(crate::IPPOOL_KEY).map(String::as_str) == Some(ippool)
    {
        return Ok(());
    }
    ctx.kube
        .patch_instance_labels(
            &instance.namespace().unwrap_or_default(),
            &instance.name_any(),
            cluster,
            ippool,
        )
        .await
}

/// Write the status unless it is already current
async fn write_status(
    ctx: &Context,
    instance: &FlexLBInstance,
    status: FlexLBInstanceStatus,
) -> Result<(), Error> {
    if instance.status.as_ref() == Some(&status) {
        return Ok(());
    }
    debug!(instance = %instance.name_any(), phase = %status.phase, "updating instance status");
    ctx.kube
        .patch_instance_status(
            &instance.namespace().unwrap_or_default(),
            &instance.name_any(),
            &status,
        )
        .await
}

/// Reconcile a FlexLBInstance
///
/// Adds the finalizer on first sight, runs the deletion path once the
/// instance is being deleted, and otherwise converges the remote instance.
/// Healthy instances are checked again after the refresh interval to catch
/// changes made directly on the fleet.
#[instrument(
    skip(instance, ctx),
    fields(instance = %instance.name_any(), namespace = ?instance.namespace())
)]
pub async fn reconcile(instance: Arc<FlexLBInstance>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();

    if is_deleting(instance.as_ref()) {
        let _permit = ctx.guard.enter("instance_deleted", format!("{namespace}/{name}")).await;
        ctx.instance_deleted(&instance).await?;
        return Ok(Action::await_change());
    }

    let _permit = ctx.guard.enter("instance_changed", format!("{namespace}/{name}")).await;

    if !has_finalizer(instance.as_ref(), FINALIZER) {
        ctx.kube
            .add_instance_finalizer(&namespace, &name, FINALIZER)
            .await?;
    }

    match ctx.instance_changed(&instance).await {
        Ok(()) => Ok(Action::requeue(ctx.refresh_interval)),
        Err(e) => {
            let action = match e {
                Error::InstanceCreateFailed { .. } => actions::CREATE,
                Error::InstanceModifyFailed { .. } => actions::MODIFY,
                _ => actions::RECONCILE,
            };
            ctx.warning(instance.as_ref(), &e, action).await;
            Err(e)
        }
    }
}

/// Error policy for the instance controller
pub fn error_policy(instance: Arc<FlexLBInstance>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        instance = %instance.name_any(),
        "reconciliation failed"
    );
    requeue_on(error)
}

//! Controller runner - builds the controller futures for each watched kind
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! drives, typically with `futures::future::join_all`. All controllers share
//! one [`Context`] so they serialize on the same guard.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use crate::controller::{
    cluster_error_policy, instance_error_policy, node_error_policy, reconcile_cluster,
    reconcile_instance, reconcile_node, reconcile_service, service_error_policy, Context,
};
use crate::crd::{FlexLBCluster, FlexLBInstance};
use crate::SERVICE_NAME_LABEL;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build every controller the operator runs
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let mut controllers = build_cluster_controllers(client.clone(), ctx.clone());
    controllers.extend(build_instance_controllers(client.clone(), ctx.clone()));
    controllers.extend(build_node_controllers(client.clone(), ctx.clone()));
    controllers.extend(build_service_controllers(client, ctx));
    controllers
}

/// Build the FlexLBCluster controller, scoped to the operator namespace
pub fn build_cluster_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let clusters: Api<FlexLBCluster> = Api::namespaced(client, &ctx.namespace);

    tracing::info!(namespace = %ctx.namespace, "- FlexLBCluster controller");

    vec![Box::pin(
        Controller::new(clusters, watcher_config())
            .shutdown_on_signal()
            .run(reconcile_cluster, cluster_error_policy, ctx)
            .for_each(log_reconcile_result("FlexLBCluster")),
    )]
}

/// Build the FlexLBInstance controller
pub fn build_instance_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let instances: Api<FlexLBInstance> = Api::all(client);

    tracing::info!("- FlexLBInstance controller");

    vec![Box::pin(
        Controller::new(instances, watcher_config())
            .shutdown_on_signal()
            .run(reconcile_instance, instance_error_policy, ctx)
            .for_each(log_reconcile_result("FlexLBInstance")),
    )]
}

/// Build the Node controller that runs traffic network discovery
pub fn build_node_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let nodes: Api<Node> = Api::all(client);

    tracing::info!("- Node controller");

    vec![Box::pin(
        Controller::new(nodes, watcher_config())
            .shutdown_on_signal()
            .run(reconcile_node, node_error_policy, ctx)
            .for_each(log_reconcile_result("Node")),
    )]
}

/// Build the Service controller
///
/// EndpointSlice changes re-trigger their Service, since readiness of
/// endpoints decides the backend servers of the instance.
pub fn build_service_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let services: Api<Service> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client);

    tracing::info!("- Service controller");

    vec![Box::pin(
        Controller::new(services, watcher_config())
            .watches(slices, watcher_config(), |slice| service_for_slice(&slice))
            .shutdown_on_signal()
            .run(reconcile_service, service_error_policy, ctx)
            .for_each(log_reconcile_result("Service")),
    )]
}

/// The Service an EndpointSlice belongs to
fn service_for_slice(slice: &EndpointSlice) -> Option<ObjectRef<Service>> {
    let name = slice.labels().get(SERVICE_NAME_LABEL)?;
    let namespace = slice.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Create a closure that logs reconciliation results for a named controller
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn slice(namespace: Option<&str>, service: Option<&str>) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some("web-abcde".to_string()),
                namespace: namespace.map(str::to_string),
                labels: service.map(|s| BTreeMap::from([(SERVICE_NAME_LABEL.to_string(), s.to_string())])),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![],
            ports: None,
        }
    }

    #[test]
    fn slice_maps_to_its_service() {
        let target = service_for_slice(&slice(Some("apps"), Some("web"))).expect("mapped");
        assert_eq!(target, ObjectRef::<Service>::new("web").within("apps"));
    }

    #[test]
    fn unlabelled_slice_maps_to_nothing() {
        assert!(service_for_slice(&slice(Some("apps"), None)).is_none());
        assert!(service_for_slice(&slice(None, Some("web"))).is_none());
    }

    #[tokio::test]
    async fn log_reconcile_result_accepts_both_outcomes() {
        let log = log_reconcile_result::<&str, &str>("Test");
        log(Ok("done")).await;
        log(Err("failed")).await;
    }
}

//! Kubernetes API access used by the FlexLB handlers
//!
//! Handlers never touch `kube::Api` directly: every read and write goes
//! through [`KubeClient`] so tests can run the handlers against mocks.
//! Reads of single objects return `Ok(None)` when the object is gone, and
//! deletes treat an already-deleted object as success.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    FlexLBCluster, FlexLBClusterStatus, FlexLBInstance, FlexLBInstanceSpec, FlexLBInstanceStatus,
};
use crate::{Error, CLUSTER_KEY, FIELD_MANAGER, IPPOOL_KEY, SERVICE_NAME_LABEL};

/// Per-node map shared by both status kinds
const NODE_STATUS: &str = "node_status";

/// Trait abstracting the Kubernetes operations of the FlexLB handlers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    // ---- FlexLBCluster -------------------------------------------------

    /// Get a FlexLBCluster from the given namespace
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<FlexLBCluster>, Error>;

    /// Replace the status of a FlexLBCluster
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FlexLBClusterStatus,
    ) -> Result<(), Error>;

    // ---- FlexLBInstance ------------------------------------------------

    /// Get a FlexLBInstance
    async fn get_instance(&self, namespace: &str, name: &str)
        -> Result<Option<FlexLBInstance>, Error>;

    /// List instances labeled with the given cluster and pool, across namespaces
    async fn list_instances(&self, cluster: &str, ippool: &str) -> Result<Vec<FlexLBInstance>, Error>;

    /// Create a FlexLBInstance
    async fn create_instance(&self, instance: &FlexLBInstance) -> Result<FlexLBInstance, Error>;

    /// Replace the spec of a FlexLBInstance
    async fn patch_instance_spec(
        &self,
        namespace: &str,
        name: &str,
        spec: &FlexLBInstanceSpec,
    ) -> Result<(), Error>;

    /// Set the cluster and pool labels used by the allocation scan
    async fn patch_instance_labels(
        &self,
        namespace: &str,
        name: &str,
        cluster: &str,
        ippool: &str,
    ) -> Result<(), Error>;

    /// Replace the status of a FlexLBInstance
    async fn patch_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FlexLBInstanceStatus,
    ) -> Result<(), Error>;

    /// Delete a FlexLBInstance
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Add a finalizer to a FlexLBInstance
    async fn add_instance_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from a FlexLBInstance
    async fn remove_instance_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    // ---- Service / EndpointSlice ---------------------------------------

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Set one annotation on a Service
    async fn set_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Remove one annotation from a Service
    async fn remove_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), Error>;

    /// Report `ip` as the Service's only load balancer ingress
    async fn patch_service_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<(), Error>;

    /// Add a finalizer to a Service
    async fn add_service_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from a Service
    async fn remove_service_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// List the EndpointSlices that belong to a Service
    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>, Error>;

    // ---- Node ----------------------------------------------------------

    /// Get a Node
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Set one annotation on a Node
    async fn set_node_annotation(&self, name: &str, key: &str, value: &str) -> Result<(), Error>;

    // ---- Pod -----------------------------------------------------------

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a Pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a Pod immediately
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Full log of a Pod's only container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<FlexLBCluster>, Error> {
        Ok(self.namespaced::<FlexLBCluster>(namespace).get_opt(name).await?)
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FlexLBClusterStatus,
    ) -> Result<(), Error> {
        let api: Api<FlexLBCluster> = self.namespaced(namespace);
        replace_status(&api, name, status).await
    }

    async fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FlexLBInstance>, Error> {
        Ok(self.namespaced::<FlexLBInstance>(namespace).get_opt(name).await?)
    }

    async fn list_instances(&self, cluster: &str, ippool: &str) -> Result<Vec<FlexLBInstance>, Error> {
        let api: Api<FlexLBInstance> = Api::all(self.client.clone());
        let selector = format!("{CLUSTER_KEY}={cluster},{IPPOOL_KEY}={ippool}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn create_instance(&self, instance: &FlexLBInstance) -> Result<FlexLBInstance, Error> {
        let namespace = instance
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("instance has no namespace"))?;
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, instance).await?)
    }

    async fn patch_instance_spec(
        &self,
        namespace: &str,
        name: &str,
        spec: &FlexLBInstanceSpec,
    ) -> Result<(), Error> {
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        let patch = json!({ "spec": spec });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_instance_labels(
        &self,
        namespace: &str,
        name: &str,
        cluster: &str,
        ippool: &str,
    ) -> Result<(), Error> {
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        let patch = json!({
            "metadata": { "labels": { CLUSTER_KEY: cluster, IPPOOL_KEY: ippool } }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FlexLBInstanceStatus,
    ) -> Result<(), Error> {
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        replace_status(&api, name, status).await
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignoring_missing(&self.namespaced::<FlexLBInstance>(namespace), name).await
    }

    async fn add_instance_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        edit_finalizers(&api, name, |f| add(f, finalizer)).await
    }

    async fn remove_instance_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<FlexLBInstance> = self.namespaced(namespace);
        edit_finalizers(&api, name, |f| remove(f, finalizer)).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.namespaced::<Service>(namespace).get_opt(name).await?)
    }

    async fn set_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let api: Api<Service> = self.namespaced(namespace);
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), Error> {
        let api: Api<Service> = self.namespaced(namespace);
        let patch = json!({ "metadata": { "annotations": { key: null } } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_service_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<(), Error> {
        let api: Api<Service> = self.namespaced(namespace);
        let patch = json!({
            "status": { "loadBalancer": { "ingress": [ { "ip": ip } ] } }
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_service_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Service> = self.namespaced(namespace);
        edit_finalizers(&api, name, |f| add(f, finalizer)).await
    }

    async fn remove_service_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Service> = self.namespaced(namespace);
        edit_finalizers(&api, name, |f| remove(f, finalizer)).await
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>, Error> {
        let api: Api<EndpointSlice> = self.namespaced(namespace);
        let selector = format!("{SERVICE_NAME_LABEL}={service}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn set_node_annotation(&self, name: &str, key: &str, value: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.namespaced::<Pod>(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = self.namespaced(namespace);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = self.namespaced(namespace);
        match api.delete(name, &DeleteParams::default().grace_period(0)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        let api: Api<Pod> = self.namespaced(namespace);
        Ok(api.logs(name, &LogParams::default()).await?)
    }
}

/// Replace the whole status of an object with one merge patch.
///
/// Both status kinds carry a `node_status` map, and a merge patch only adds
/// keys to a map, so nodes missing from `status` are sent as null.
async fn replace_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    S: Serialize + Sync,
{
    let current = api.get_status(name).await?;
    let current = serde_json::to_value(&current).map_err(|e| Error::serialization(e.to_string()))?;
    let desired = serde_json::to_value(status).map_err(|e| Error::serialization(e.to_string()))?;
    let patch = status_patch(current.get("status"), desired);
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge patch turning `current` into `desired`, nulling stale node_status keys
fn status_patch(current: Option<&Value>, mut desired: Value) -> Value {
    let stale: Vec<String> = current
        .and_then(|c| c.get(NODE_STATUS))
        .and_then(Value::as_object)
        .map(|nodes| {
            nodes
                .keys()
                .filter(|node| desired.get(NODE_STATUS).and_then(|d| d.get(node.as_str())).is_none())
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if !stale.is_empty() {
        if let Some(fields) = desired.as_object_mut() {
            let nodes = fields
                .entry(NODE_STATUS)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(nodes) = nodes.as_object_mut() {
                for node in stale {
                    nodes.insert(node, Value::Null);
                }
            }
        }
    }
    json!({ "status": desired })
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read the object's finalizers, apply `edit`, and write them back if it
/// reported a change. A missing object is left alone.
async fn edit_finalizers<K, F>(api: &Api<K>, name: &str, edit: F) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    F: FnOnce(&mut Vec<String>) -> bool + Send,
{
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if !edit(&mut finalizers) {
        return Ok(());
    }

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn add(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

fn remove(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Whether the object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Whether the object is being deleted
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

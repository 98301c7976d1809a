//! Service reconciliation: binding LoadBalancer Services to instances
//!
//! The Service and its instance point at each other through annotations:
//! the Service names its cluster, pool and instance, the instance names its
//! Service. Nothing else records the binding.
//!
//! Backends are the Service's node ports on the nodes hosting its ready
//! endpoints, addressed on the pool's backend network. A node that has not
//! been probed yet contributes no backends until a later pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use super::node::recorded_networks;
use super::{requeue_on, Context, ServiceChanged, ServiceDeleted};
use crate::crd::{
    BackendServer, Endpoint, EndpointMode, FlexLBInstance, FlexLBInstanceSpec, IPPool,
    InstanceConfig,
};
use crate::events::{actions, reasons};
use crate::kube_client::{has_finalizer, is_deleting};
use crate::probe::traffic_ip;
use crate::{
    ipam, Error, CLUSTER_KEY, DEFAULT_CLUSTER_NAME, DEFAULT_IPPOOL_NAME, FINALIZER, INSTANCE_KEY,
    IPPOOL_KEY, SERVICE_KEY,
};

/// Service type handled by this operator
const LOAD_BALANCER: &str = "LoadBalancer";

#[async_trait]
impl ServiceChanged for Context {
    async fn service_changed(&self, service: &Service) -> Result<(), Error> {
        if !is_load_balancer(service) {
            return self.service_deleted(service).await;
        }

        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();
        let bound = service.annotations().get(INSTANCE_KEY).cloned();

        if bound.is_none() && !ingress_ips(service).is_empty() {
            debug!(service = %name, "load balancer owned by another implementation");
            return Ok(());
        }

        if !has_finalizer(service, FINALIZER) {
            self.kube
                .add_service_finalizer(&namespace, &name, FINALIZER)
                .await?;
        }

        let cluster_name = annotation_or(service, CLUSTER_KEY, DEFAULT_CLUSTER_NAME);
        let ippool_name = annotation_or(service, IPPOOL_KEY, DEFAULT_IPPOOL_NAME);
        let no_pool = || Error::NoIPPool {
            cluster: cluster_name.clone(),
            pool: ippool_name.clone(),
        };
        let cluster = self
            .kube
            .get_cluster(&self.namespace, &cluster_name)
            .await?
            .ok_or_else(no_pool)?;
        let pool = cluster.spec.ippool(&ippool_name).ok_or_else(no_pool)?;

        let endpoints = self.synthesize(service, pool).await?;
        if endpoints.iter().all(|e| e.backend_servers.is_empty()) {
            return Err(Error::NoBackends(format!("{namespace}/{name}")));
        }

        let existing = match bound.as_deref() {
            Some(instance) => self.kube.get_instance(&namespace, instance).await?,
            None => None,
        };
        let instance = match existing {
            Some(instance) => {
                update_binding(self, instance, &cluster_name, pool, endpoints).await?
            }
            None => create_binding(self, service, &cluster_name, pool, endpoints).await?,
        };

        record_binding(self, service, &instance).await
    }
}

#[async_trait]
impl ServiceDeleted for Context {
    async fn service_deleted(&self, service: &Service) -> Result<(), Error> {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();

        if let Some(instance) = service.annotations().get(INSTANCE_KEY) {
            self.kube.delete_instance(&namespace, instance).await?;
            self.kube
                .remove_service_annotation(&namespace, &name, INSTANCE_KEY)
                .await?;
            info!(service = %name, %instance, "released load balancer");
            self.normal(
                service,
                reasons::BALANCER_UNBOUND,
                actions::DELETE,
                format!("Released instance {instance}"),
            )
            .await;
        }

        if has_finalizer(service, FINALIZER) {
            self.kube
                .remove_service_finalizer(&namespace, &name, FINALIZER)
                .await?;
        }
        Ok(())
    }
}

impl Context {
    /// Desired endpoints of a Service's instance, one per supported port
    pub async fn synthesize(&self, service: &Service, pool: &IPPool) -> Result<Vec<Endpoint>, Error> {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();

        let slices = self.kube.list_endpoint_slices(&namespace, &name).await?;
        let targets = ready_targets(&slices);

        let mut node_ips: BTreeMap<&str, Option<String>> = BTreeMap::new();
        for node in targets.values() {
            if node_ips.contains_key(node.as_str()) {
                continue;
            }
            let ip = self
                .kube
                .get_node(node)
                .await?
                .and_then(|n| recorded_networks(&n))
                .and_then(|networks| {
                    traffic_ip(&networks, &pool.backend_network).map(str::to_string)
                });
            if ip.is_none() {
                warn!(
                    service = %name,
                    %node,
                    network = %pool.backend_network,
                    "node has no address on the backend network"
                );
            }
            node_ips.insert(node.as_str(), ip);
        }

        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut endpoints = Vec::with_capacity(ports.len());
        for port in ports {
            let Some(mode) = EndpointMode::from_protocol(port.protocol.as_deref()) else {
                warn!(service = %name, port = port.port, protocol = ?port.protocol, "unsupported protocol, skipping port");
                continue;
            };
            let (Ok(frontend_port), Some(Ok(node_port))) =
                (u16::try_from(port.port), port.node_port.map(u16::try_from))
            else {
                warn!(service = %name, port = port.port, "port has no node port, skipping");
                continue;
            };

            let servers = targets
                .iter()
                .filter_map(|(target, node)| {
                    let ip = node_ips.get(node.as_str())?.as_ref()?;
                    Some(BackendServer {
                        name: target.clone(),
                        ipaddress: ip.clone(),
                        port: node_port,
                    })
                })
                .collect();
            endpoints.push(Endpoint::new(frontend_port, mode, servers));
        }
        Ok(endpoints)
    }
}

/// Ready endpoints across all slices, target name to hosting node, ordered
/// by target so the synthesized config is stable between passes
fn ready_targets(slices: &[EndpointSlice]) -> BTreeMap<String, String> {
    slices
        .iter()
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|ep| {
            ep.conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true)
        })
        .filter_map(|ep| {
            let node = ep.node_name.clone()?;
            let target = ep
                .target_ref
                .as_ref()
                .and_then(|r| r.name.clone())
                .or_else(|| ep.addresses.first().cloned())?;
            Some((target, node))
        })
        .collect()
}

async fn create_binding(
    ctx: &Context,
    service: &Service,
    cluster: &str,
    pool: &IPPool,
    endpoints: Vec<Endpoint>,
) -> Result<FlexLBInstance, Error> {
    let service_name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let held = ctx.kube.list_instances(cluster, &pool.name).await?;

    // An earlier pass may have created the instance and failed before the
    // Service recorded it.
    if let Some(stray) = held.iter().find(|i| {
        !is_deleting(*i)
            && i.namespace().as_deref() == Some(namespace.as_str())
            && i.annotations().get(SERVICE_KEY) == Some(&service_name)
    }) {
        info!(service = %service_name, instance = %stray.name_any(), "adopting existing instance");
        return update_binding(ctx, stray.clone(), cluster, pool, endpoints).await;
    }

    let name = instance_name(&service_name);
    let frontend = free_address(pool, &held, None)?;
    let spec = FlexLBInstanceSpec {
        cluster: Some(cluster.to_string()),
        ippool: Some(pool.name.clone()),
        config: InstanceConfig {
            name: name.clone(),
            frontend_interface: pool.interface.clone(),
            frontend_net_prefix: pool.net_prefix,
            frontend_ipaddress: frontend,
            endpoints,
        },
    };

    let mut instance = FlexLBInstance::new(&name, spec);
    instance.metadata.namespace = Some(namespace.clone());
    instance.metadata.annotations = Some(BTreeMap::from([(
        SERVICE_KEY.to_string(),
        service_name.clone(),
    )]));
    instance.metadata.labels = Some(BTreeMap::from([
        (CLUSTER_KEY.to_string(), cluster.to_string()),
        (IPPOOL_KEY.to_string(), pool.name.clone()),
    ]));

    let created = ctx.kube.create_instance(&instance).await?;
    info!(
        service = %service_name,
        instance = %name,
        frontend = %created.spec.config.frontend_ipaddress,
        "created instance for service"
    );
    ctx.normal(
        service,
        reasons::BALANCER_BOUND,
        actions::BIND,
        format!(
            "Bound to instance {name} at {}",
            created.spec.config.frontend_ipaddress
        ),
    )
    .await;
    Ok(created)
}

/// Bring a bound instance in line with the Service. Nothing is written when
/// cluster, pool and endpoints are unchanged.
async fn update_binding(
    ctx: &Context,
    instance: FlexLBInstance,
    cluster: &str,
    pool: &IPPool,
    endpoints: Vec<Endpoint>,
) -> Result<FlexLBInstance, Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    let same_target =
        instance.spec.cluster_name() == cluster && instance.spec.ippool_name() == pool.name;

    if same_target && instance.spec.config.endpoints == endpoints {
        debug!(instance = %name, "instance already matches service");
        return Ok(instance);
    }

    let mut spec = instance.spec.clone();
    spec.cluster = Some(cluster.to_string());
    spec.ippool = Some(pool.name.clone());
    spec.config.name = name.clone();
    spec.config.endpoints = endpoints;

    if !same_target {
        let frontend = allocate(ctx, cluster, pool, Some(&name)).await?;
        info!(instance = %name, %cluster, pool = %pool.name, %frontend, "moving instance to new pool");
        spec.config.frontend_interface = pool.interface.clone();
        spec.config.frontend_net_prefix = pool.net_prefix;
        spec.config.frontend_ipaddress = frontend;
    }

    ctx.kube.patch_instance_spec(&namespace, &name, &spec).await?;
    if !same_target {
        // the next allocation scan must already see the new address
        ctx.kube
            .patch_instance_labels(&namespace, &name, cluster, &pool.name)
            .await?;
    }
    debug!(instance = %name, "updated instance from service");

    Ok(FlexLBInstance { spec, ..instance })
}

/// Lowest free frontend address of the pool, ignoring `own` instance
async fn allocate(
    ctx: &Context,
    cluster: &str,
    pool: &IPPool,
    own: Option<&str>,
) -> Result<String, Error> {
    let held = ctx.kube.list_instances(cluster, &pool.name).await?;
    free_address(pool, &held, own)
}

fn free_address(
    pool: &IPPool,
    held: &[FlexLBInstance],
    own: Option<&str>,
) -> Result<String, Error> {
    let taken: Vec<&str> = held
        .iter()
        .filter(|i| own != Some(i.name_any().as_str()))
        .map(|i| i.spec.config.frontend_ipaddress.as_str())
        .filter(|ip| !ip.is_empty())
        .collect();
    Ok(ipam::allocate(&pool.start, &pool.end, &taken[..])?.to_string())
}

/// Write the binding annotations and the ingress address, skipping what is
/// already current
async fn record_binding(
    ctx: &Context,
    service: &Service,
    instance: &FlexLBInstance,
) -> Result<(), Error> {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let instance_name = instance.name_any();

    let wanted = [
        (CLUSTER_KEY, instance.spec.cluster_name()),
        (IPPOOL_KEY, instance.spec.ippool_name()),
        (INSTANCE_KEY, instance_name.as_str()),
    ];
    for (key, value) in wanted {
        if service.annotations().get(key).map(String::as_str) != Some(value) {
            ctx.kube
                .set_service_annotation(&namespace, &name, key, value)
                .await?;
        }
    }

    let frontend = &instance.spec.config.frontend_ipaddress;
    if ingress_ips(service) != [frontend.as_str()] {
        ctx.kube
            .patch_service_ingress(&namespace, &name, frontend)
            .await?;
        info!(service = %name, ip = %frontend, "reported load balancer ingress");
    }
    Ok(())
}

fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some(LOAD_BALANCER)
}

fn ingress_ips(service: &Service) -> Vec<&str> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.as_deref()).collect())
        .unwrap_or_default()
}

fn annotation_or(service: &Service, key: &str, default: &str) -> String {
    service
        .annotations()
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// `<service>-<4 hex digits>`
fn instance_name(service: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("{service}-{suffix:04x}")
}

/// Reconcile a Service
///
/// Runs the binding on every change of the Service or its EndpointSlices,
/// and the release path once the Service is being deleted.
#[instrument(
    skip(service, ctx),
    fields(service = %service.name_any(), namespace = ?service.namespace())
)]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let managed = is_load_balancer(&service)
        || has_finalizer(service.as_ref(), FINALIZER)
        || service.annotations().contains_key(INSTANCE_KEY);
    if !managed {
        return Ok(Action::await_change());
    }

    let object = format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );

    let result = if is_deleting(service.as_ref()) {
        let _permit = ctx.guard.enter("service_deleted", object).await;
        ctx.service_deleted(&service).await
    } else {
        let _permit = ctx.guard.enter("service_changed", object).await;
        ctx.service_changed(&service).await
    };

    match result {
        Ok(()) => Ok(Action::await_change()),
        Err(e) => {
            ctx.warning(service.as_ref(), &e, actions::BIND).await;
            Err(e)
        }
    }
}

/// Error policy for the Service controller
pub fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        service = %service.name_any(),
        "reconciliation failed"
    );
    requeue_on(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fixtures;
    use crate::events::MockEventPublisher;
    use crate::fleet::MockFleetConnector;
    use crate::kube_client::MockKubeClient;
    use crate::probe::NetworkDescriptor;
    use crate::crd::DEFAULT_BACKEND_SERVER_OPTIONS;
    use k8s_openapi::api::core::v1::{Node, ObjectReference};
    use k8s_openapi::api::discovery::v1::{Endpoint as SliceEndpoint, EndpointConditions};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn slice_endpoint(pod: &str, node: &str, ready: bool) -> SliceEndpoint {
        SliceEndpoint {
            addresses: vec![format!("10.244.0.{}", pod.len())],
            conditions: Some(EndpointConditions {
                ready: Some(ready),
                ..Default::default()
            }),
            node_name: Some(node.to_string()),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice(endpoints: Vec<SliceEndpoint>) -> EndpointSlice {
        EndpointSlice {
            address_type: "IPv4".to_string(),
            endpoints,
            metadata: ObjectMeta {
                name: Some("web-abcde".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ports: None,
        }
    }

    fn probed_node(name: &str, ip: &str) -> Node {
        let networks = vec![
            NetworkDescriptor {
                network: "10.96.0.0/16".to_string(),
                device: "eth0".to_string(),
                ip_address: "10.96.0.5".to_string(),
            },
            NetworkDescriptor {
                network: "192.168.10.0/24".to_string(),
                device: "eth1".to_string(),
                ip_address: ip.to_string(),
            },
        ];
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    crate::NODE_NETWORK_KEY.to_string(),
                    serde_json::to_string(&networks).unwrap(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn unprobed_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Three ready pods on three nodes; node-c has never been probed
    fn topology(kube: &mut MockKubeClient) {
        kube.expect_list_endpoint_slices().returning(|_, _| {
            Ok(vec![slice(vec![
                slice_endpoint("web-0", "node-a", true),
                slice_endpoint("web-1", "node-b", true),
                slice_endpoint("web-2", "node-c", true),
                slice_endpoint("web-3", "node-a", false),
            ])])
        });
        kube.expect_get_node().returning(|name| {
            Ok(Some(match name {
                "node-a" => probed_node(name, "192.168.10.21"),
                "node-b" => probed_node(name, "192.168.10.22"),
                _ => unprobed_node(name),
            }))
        });
    }

    fn two_tcp_ports() -> Service {
        fixtures::lb_service(
            "web",
            vec![fixtures::port(80, 30080, "TCP"), fixtures::port(443, 30443, "TCP")],
        )
    }

    fn bound(mut service: Service, instance: &str) -> Service {
        service.metadata.annotations = Some(BTreeMap::from([
            (CLUSTER_KEY.to_string(), "default".to_string()),
            (IPPOOL_KEY.to_string(), "default".to_string()),
            (INSTANCE_KEY.to_string(), instance.to_string()),
        ]));
        service.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        service
    }

    fn expected_servers(port: u16) -> Vec<BackendServer> {
        vec![
            BackendServer {
                name: "web-0".to_string(),
                ipaddress: "192.168.10.21".to_string(),
                port,
            },
            BackendServer {
                name: "web-1".to_string(),
                ipaddress: "192.168.10.22".to_string(),
                port,
            },
        ]
    }

    /// Captured instance creates
    #[derive(Clone, Default)]
    struct CreateCapture {
        created: Arc<Mutex<Vec<FlexLBInstance>>>,
    }

    impl CreateCapture {
        fn only(&self) -> FlexLBInstance {
            let created = self.created.lock().unwrap();
            assert_eq!(created.len(), 1, "exactly one instance should be created");
            created[0].clone()
        }
    }

    /// Kube mock for a first binding: cluster exists, `held` frontends are taken
    fn kube_for_new_binding(held: &'static [&'static str]) -> (MockKubeClient, CreateCapture) {
        let capture = CreateCapture::default();
        let recorder = capture.clone();
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        kube.expect_add_service_finalizer()
            .returning(|_, _, _| Ok(()));
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_list_instances()
            .withf(|cluster, pool| cluster == "default" && pool == "default")
            .returning(move |_, _| {
                Ok(held
                    .iter()
                    .enumerate()
                    .map(|(i, ip)| fixtures::instance(&format!("other-{i}"), "other", ip))
                    .collect())
            });
        kube.expect_create_instance().returning(move |instance| {
            recorder.created.lock().unwrap().push(instance.clone());
            Ok(instance.clone())
        });
        kube.expect_set_service_annotation()
            .returning(|_, _, _, _| Ok(()));
        kube.expect_patch_service_ingress()
            .returning(|_, _, _| Ok(()));
        (kube, capture)
    }

    // =========================================================================
    // Synthesis
    // =========================================================================

    /// Story: two TCP ports and three ready pods, one of them on a node that
    /// was never probed, give two endpoints with two backends each
    #[tokio::test]
    async fn story_unprobed_node_is_left_out_of_every_port() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let endpoints = ctx
            .synthesize(&two_tcp_ports(), &fixtures::pool())
            .await
            .unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].frontend_port, 80);
        assert_eq!(endpoints[0].backend_servers, expected_servers(30080));
        assert_eq!(endpoints[1].frontend_port, 443);
        assert_eq!(endpoints[1].backend_servers, expected_servers(30443));
        assert_eq!(endpoints[0].balance, "roundrobin");
        assert_eq!(endpoints[0].backend_default_server, DEFAULT_BACKEND_SERVER_OPTIONS);
    }

    /// Story: an SCTP port next to a TCP port yields a single endpoint
    #[tokio::test]
    async fn story_sctp_port_is_dropped() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let service = fixtures::lb_service(
            "web",
            vec![fixtures::port(80, 30080, "TCP"), fixtures::port(9000, 30900, "SCTP")],
        );
        let endpoints = ctx.synthesize(&service, &fixtures::pool()).await.unwrap();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].mode, EndpointMode::Tcp);
    }

    #[tokio::test]
    async fn udp_ports_are_kept_and_ports_without_node_port_skipped() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let mut no_node_port = fixtures::port(8080, 0, "TCP");
        no_node_port.node_port = None;
        let service = fixtures::lb_service(
            "dns",
            vec![fixtures::port(53, 30053, "UDP"), no_node_port],
        );
        let endpoints = ctx.synthesize(&service, &fixtures::pool()).await.unwrap();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].mode, EndpointMode::Udp);
    }

    #[test]
    fn targets_are_merged_across_slices_and_sorted() {
        let slices = vec![
            slice(vec![slice_endpoint("web-2", "node-b", true)]),
            slice(vec![
                slice_endpoint("web-1", "node-a", true),
                slice_endpoint("web-2", "node-b", true),
            ]),
        ];
        let targets: Vec<_> = ready_targets(&slices).into_keys().collect();
        assert_eq!(targets, vec!["web-1", "web-2"]);
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Story: a new Service gets the lowest free address of its pool, and the
    /// binding is recorded on both sides
    #[tokio::test]
    async fn story_new_service_is_bound_to_lowest_free_address() {
        let (kube, capture) = kube_for_new_binding(&["10.0.0.1", "10.0.0.2"]);
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let action = reconcile(Arc::new(two_tcp_ports()), ctx)
            .await
            .expect("binding should succeed");
        assert_eq!(action, Action::await_change());

        let instance = capture.only();
        assert_eq!(instance.spec.config.frontend_ipaddress, "10.0.0.3");
        assert_eq!(instance.spec.config.frontend_interface, "eth0");
        assert_eq!(instance.spec.config.frontend_net_prefix, 24);
        assert_eq!(instance.spec.config.endpoints.len(), 2);
        assert_eq!(instance.namespace().as_deref(), Some("apps"));
        assert_eq!(instance.annotations().get(SERVICE_KEY).map(String::as_str), Some("web"));
        assert_eq!(instance.labels().get(CLUSTER_KEY).map(String::as_str), Some("default"));
        assert_eq!(instance.labels().get(IPPOOL_KEY).map(String::as_str), Some("default"));

        let name = instance.name_any();
        let suffix = name.strip_prefix("web-").expect("name starts with service");
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(instance.spec.config.name, name);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_without_creating() {
        let (kube, capture) = kube_for_new_binding(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let err = ctx.service_changed(&two_tcp_ports()).await.unwrap_err();

        assert!(matches!(err, Error::RangeExhausted { .. }));
        assert_eq!(err.reason(), "ErrorNoIPPool");
        assert!(capture.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_pool_is_reported() {
        let mut kube = MockKubeClient::new();
        kube.expect_add_service_finalizer()
            .returning(|_, _, _| Ok(()));
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_create_instance().never();
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == "ErrorNoIPPool")
            .times(1)
            .returning(|_, _, _, _, _| ());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MockFleetConnector::new()),
            Arc::new(events),
        ));

        let mut service = two_tcp_ports();
        service.metadata.annotations = Some(BTreeMap::from([(
            IPPOOL_KEY.to_string(),
            "public".to_string(),
        )]));
        let err = reconcile(Arc::new(service), ctx).await.unwrap_err();
        assert!(matches!(err, Error::NoIPPool { .. }));
    }

    #[tokio::test]
    async fn service_without_resolvable_backends_is_not_bound() {
        let mut kube = MockKubeClient::new();
        kube.expect_add_service_finalizer()
            .returning(|_, _, _| Ok(()));
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_list_endpoint_slices()
            .returning(|_, _| Ok(vec![slice(vec![slice_endpoint("web-0", "node-c", true)])]));
        kube.expect_get_node()
            .returning(|name| Ok(Some(unprobed_node(name))));
        kube.expect_create_instance().never();
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let err = ctx.service_changed(&two_tcp_ports()).await.unwrap_err();
        assert!(matches!(err, Error::NoBackends(_)));
    }

    /// Story: re-reconciling a Service whose topology did not change writes
    /// nothing
    #[tokio::test]
    async fn story_unchanged_service_issues_no_updates() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_get_instance().returning(|_, name| {
            let mut instance = fixtures::instance(name, "web", "10.0.0.1");
            instance.spec.config.endpoints = vec![
                Endpoint::new(80, EndpointMode::Tcp, expected_servers(30080)),
                Endpoint::new(443, EndpointMode::Tcp, expected_servers(30443)),
            ];
            Ok(Some(instance))
        });
        kube.expect_add_service_finalizer().never();
        kube.expect_create_instance().never();
        kube.expect_patch_instance_spec().never();
        kube.expect_patch_instance_labels().never();
        kube.expect_set_service_annotation().never();
        kube.expect_patch_service_ingress().never();
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let service = fixtures::with_ingress(bound(two_tcp_ports(), "web-1a2b"), "10.0.0.1");
        reconcile(Arc::new(service), ctx)
            .await
            .expect("reconcile should succeed");
    }

    #[tokio::test]
    async fn topology_change_updates_endpoints_and_keeps_frontend() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_get_instance()
            .returning(|_, name| Ok(Some(fixtures::instance(name, "web", "10.0.0.2"))));
        kube.expect_list_instances().never();
        let patched = Arc::new(Mutex::new(None::<FlexLBInstanceSpec>));
        let sink = patched.clone();
        kube.expect_patch_instance_spec()
            .times(1)
            .returning(move |_, _, spec| {
                *sink.lock().unwrap() = Some(spec.clone());
                Ok(())
            });
        kube.expect_patch_instance_labels().never();
        kube.expect_patch_service_ingress()
            .withf(|_, _, ip| ip == "10.0.0.2")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let service = bound(two_tcp_ports(), "web-1a2b");
        ctx.service_changed(&service).await.unwrap();

        let spec = patched.lock().unwrap().clone().unwrap();
        assert_eq!(spec.config.frontend_ipaddress, "10.0.0.2");
        assert_eq!(spec.config.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn pool_change_reallocates_the_frontend() {
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        kube.expect_get_cluster().returning(|_, name| {
            let mut cluster = fixtures::cluster(name);
            cluster.spec.ippools.push(IPPool {
                name: "public".to_string(),
                interface: "eth2".to_string(),
                net_prefix: 28,
                start: "172.16.5.10".to_string(),
                end: "172.16.5.20".to_string(),
                backend_network: "192.168.10.0/24".to_string(),
            });
            Ok(Some(cluster))
        });
        kube.expect_get_instance()
            .returning(|_, name| Ok(Some(fixtures::instance(name, "web", "10.0.0.2"))));
        kube.expect_list_instances()
            .withf(|_, pool| pool == "public")
            .returning(|_, _| Ok(vec![fixtures::instance("api-ffff", "api", "172.16.5.10")]));
        let patched = Arc::new(Mutex::new(None::<FlexLBInstanceSpec>));
        let sink = patched.clone();
        kube.expect_patch_instance_spec()
            .returning(move |_, _, spec| {
                *sink.lock().unwrap() = Some(spec.clone());
                Ok(())
            });
        kube.expect_patch_instance_labels()
            .withf(|_, _, cluster, pool| cluster == "default" && pool == "public")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        kube.expect_set_service_annotation()
            .returning(|_, _, _, _| Ok(()));
        kube.expect_patch_service_ingress()
            .withf(|_, _, ip| ip == "172.16.5.11")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let mut service = bound(two_tcp_ports(), "web-1a2b");
        service
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(IPPOOL_KEY.to_string(), "public".to_string());
        ctx.service_changed(&service).await.unwrap();

        let spec = patched.lock().unwrap().clone().unwrap();
        assert_eq!(spec.ippool.as_deref(), Some("public"));
        assert_eq!(spec.config.frontend_interface, "eth2");
        assert_eq!(spec.config.frontend_net_prefix, 28);
        assert_eq!(spec.config.frontend_ipaddress, "172.16.5.11");
    }

    #[tokio::test]
    async fn missing_bound_instance_is_recreated() {
        let (mut kube, capture) = kube_for_new_binding(&[]);
        kube.expect_get_instance().returning(|_, _| Ok(None));
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        ctx.service_changed(&bound(two_tcp_ports(), "web-gone"))
            .await
            .unwrap();

        let instance = capture.only();
        assert_ne!(instance.name_any(), "web-gone");
        assert_eq!(instance.spec.config.frontend_ipaddress, "10.0.0.1");
    }

    /// Story: the instance is created but recording it on the Service fails;
    /// the retry adopts that instance instead of creating a second one
    #[tokio::test]
    async fn story_interrupted_binding_is_adopted_on_retry() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let capture = CreateCapture::default();
        let recorder = capture.clone();
        let listed = capture.clone();
        let mut kube = MockKubeClient::new();
        topology(&mut kube);
        kube.expect_add_service_finalizer()
            .returning(|_, _, _| Ok(()));
        kube.expect_get_cluster()
            .returning(|_, name| Ok(Some(fixtures::cluster(name))));
        kube.expect_list_instances()
            .returning(move |_, _| Ok(listed.created.lock().unwrap().clone()));
        kube.expect_create_instance().returning(move |instance| {
            recorder.created.lock().unwrap().push(instance.clone());
            Ok(instance.clone())
        });
        kube.expect_patch_instance_spec().never();

        let failed_once = Arc::new(AtomicBool::new(false));
        let written = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = written.clone();
        kube.expect_set_service_annotation()
            .returning(move |_, _, key, value| {
                if key == INSTANCE_KEY && !failed_once.swap(true, Ordering::SeqCst) {
                    return Err(Error::validation("apiserver unavailable"));
                }
                if key == INSTANCE_KEY {
                    sink.lock().unwrap().push(value.to_string());
                }
                Ok(())
            });
        kube.expect_patch_service_ingress()
            .withf(|_, _, ip| ip == "10.0.0.1")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let service = two_tcp_ports();
        ctx.service_changed(&service).await.unwrap_err();
        ctx.service_changed(&service)
            .await
            .expect("retry should adopt the instance");

        let instance = capture.only();
        assert_eq!(*written.lock().unwrap(), vec![instance.name_any()]);
    }

    #[tokio::test]
    async fn foreign_load_balancer_is_ignored() {
        let mut kube = MockKubeClient::new();
        kube.expect_add_service_finalizer().never();
        kube.expect_list_endpoint_slices().never();
        let ctx = fixtures::context(kube, MockFleetConnector::new());

        let service = fixtures::with_ingress(two_tcp_ports(), "203.0.113.7");
        ctx.service_changed(&service).await.unwrap();
    }

    // =========================================================================
    // Release
    // =========================================================================

    fn kube_expecting_release() -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_delete_instance()
            .withf(|ns, name| ns == "apps" && name == "web-1a2b")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_remove_service_annotation()
            .withf(|ns, name, key| ns == "apps" && name == "web" && key == INSTANCE_KEY)
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_remove_service_finalizer()
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube
    }

    /// Story: deleting a bound Service removes its instance and clears the
    /// binding annotation
    #[tokio::test]
    async fn story_deleted_service_releases_its_instance() {
        let ctx = fixtures::context(kube_expecting_release(), MockFleetConnector::new());

        let mut service = bound(two_tcp_ports(), "web-1a2b");
        service.metadata.deletion_timestamp = Some(Time(Default::default()));
        let action = reconcile(Arc::new(service), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn service_that_stops_being_a_load_balancer_is_released() {
        let ctx = fixtures::context(kube_expecting_release(), MockFleetConnector::new());

        let mut service = bound(two_tcp_ports(), "web-1a2b");
        if let Some(spec) = service.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
        reconcile(Arc::new(service), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unmanaged_service_is_ignored() {
        let ctx = fixtures::context(MockKubeClient::new(), MockFleetConnector::new());

        let mut service = two_tcp_ports();
        if let Some(spec) = service.spec.as_mut() {
            spec.type_ = Some("NodePort".to_string());
        }
        let action = reconcile(Arc::new(service), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}

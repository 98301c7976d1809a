//! FlexLB operator - external load balancers for Kubernetes LoadBalancer Services

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use flexlb_operator::config::Cli;
use flexlb_operator::controller::Context;
use flexlb_operator::controller_runner;
use flexlb_operator::crd::{FlexLBCluster, FlexLBInstance};
use flexlb_operator::retry::{retry_with_backoff, RetryConfig};
use flexlb_operator::{telemetry, FIELD_MANAGER};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("FATAL: failed to install rustls crypto provider");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_yaml::to_string(&FlexLBCluster::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&FlexLBInstance::crd())?);
        return Ok(());
    }

    telemetry::init()?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(
        namespace = %cli.namespace,
        refresh_interval_secs = cli.refresh_interval,
        "Starting FlexLB operator"
    );

    let tls = cli.tls_material()?;
    let client = Client::try_default().await?;

    retry_with_backoff(&RetryConfig::default(), "install_crds", || {
        ensure_crds_installed(client.clone())
    })
    .await?;

    let ctx = Context::builder(client.clone())
        .namespace(cli.namespace.clone())
        .refresh_interval(cli.refresh_interval())
        .probe(cli.probe_settings())
        .tls(tls)
        .build()?;

    tracing::info!("Starting controllers:");
    let controllers = controller_runner::build_controllers(client, Arc::new(ctx));
    futures::future::join_all(controllers).await;

    tracing::info!("FlexLB operator shutting down");
    Ok(())
}

/// Install or update the FlexLB CRDs with server-side apply
async fn ensure_crds_installed(client: Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        ("flexlbclusters.crd.flexlb.gitee.io", FlexLBCluster::crd()),
        ("flexlbinstances.crd.flexlb.gitee.io", FlexLBInstance::crd()),
    ] {
        tracing::info!(crd = name, "Installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd)).await?;
    }

    Ok(())
}

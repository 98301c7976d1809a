//! Operator configuration from the command line and environment
//!
//! Every option has an environment fallback so the operator can be configured
//! from a Deployment manifest without arguments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::fleet::TlsMaterial;
use crate::probe::ProbeSettings;
use crate::{Error, DEFAULT_NAMESPACE, DEFAULT_PROBE_IMAGE, DEFAULT_REFRESH_INTERVAL_SECS};

/// FlexLB operator - provisions FlexLB instances for LoadBalancer Services
#[derive(Parser, Debug, Clone)]
#[command(name = "flexlb-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// CA certificate (PEM file) used to verify FlexLB cluster endpoints
    #[arg(long, env = "FLEXLB_TLS_CA_CERT")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Client certificate (PEM file) presented to FlexLB clusters
    #[arg(long, env = "FLEXLB_TLS_CLIENT_CERT")]
    pub tls_client_cert: Option<PathBuf>,

    /// Client private key (PEM file) matching the client certificate
    #[arg(long, env = "FLEXLB_TLS_CLIENT_KEY")]
    pub tls_client_key: Option<PathBuf>,

    /// Skip verification of FlexLB cluster certificates
    #[arg(long, env = "FLEXLB_TLS_INSECURE")]
    pub tls_insecure: bool,

    /// Namespace holding FlexLBCluster resources and node probe pods
    #[arg(long, env = "FLEXLB_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Seconds between periodic checks of clusters and instances
    #[arg(long, env = "FLEXLB_REFRESH_INTERVAL", default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
    pub refresh_interval: u64,

    /// Image used by node probe pods; needs `sh`, `ip` and `awk`
    #[arg(long, env = "FLEXLB_PROBE_IMAGE", default_value = DEFAULT_PROBE_IMAGE)]
    pub probe_image: String,
}

impl Cli {
    /// Load the TLS material named on the command line
    pub fn tls_material(&self) -> Result<TlsMaterial, Error> {
        if self.tls_client_cert.is_some() != self.tls_client_key.is_some() {
            return Err(Error::invalid_config(
                "client certificate and client key must be given together",
            ));
        }
        Ok(TlsMaterial {
            ca_cert_pem: read_pem(self.tls_ca_cert.as_deref())?,
            client_cert_pem: read_pem(self.tls_client_cert.as_deref())?,
            client_key_pem: read_pem(self.tls_client_key.as_deref())?,
            insecure: self.tls_insecure,
        })
    }

    /// Probe settings for the configured namespace and image
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            namespace: self.namespace.clone(),
            image: self.probe_image.clone(),
            ..Default::default()
        }
    }

    /// Interval between periodic checks
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

fn read_pem(path: Option<&Path>) -> Result<Option<String>, Error> {
    let Some(path) = path else {
        return Ok(None);
    };
    std::fs::read_to_string(path)
        .map(Some)
        .map_err(|e| Error::invalid_config(format!("failed to read {}: {e}", path.display())))
}

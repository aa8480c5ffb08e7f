//! Sandbox reachability probes used when deciding whether to reuse a session.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

use crate::provisioner::{Provisioner, SandboxKey, TERMINAL_PORT};

/// Decides whether an existing sandbox can serve a reused session.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// The pod IP when the sandbox is reachable, otherwise None.
    async fn probe(&self, key: SandboxKey) -> Option<String>;
}

/// Reachable when the pod exists and has an IP.
pub struct PodIpProbe {
    provisioner: Arc<Provisioner>,
}

impl PodIpProbe {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl ReachabilityProbe for PodIpProbe {
    async fn probe(&self, key: SandboxKey) -> Option<String> {
        match self.provisioner.pod_ip(key).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Sandbox {} unreachable: {}", key, e);
                None
            }
        }
    }
}

/// Additionally requires the terminal port to answer HTTP.
pub struct HttpProbe {
    provisioner: Arc<Provisioner>,
    client: reqwest::Client,
    port: u16,
}

impl HttpProbe {
    pub fn new(provisioner: Arc<Provisioner>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provisioner,
            client,
            port: TERMINAL_PORT,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self, key: SandboxKey) -> Option<String> {
        let ip = PodIpProbe::new(self.provisioner.clone()).probe(key).await?;
        let url = format!("http://{}:{}/", ip, self.port);
        match self.client.get(&url).send().await {
            // Any HTTP answer means the pod network path works.
            Ok(_) => Some(ip),
            Err(e) => {
                debug!("Sandbox {} did not answer on {}: {}", key, url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::provisioner::{ProvisionerConfig, ResourceOverrides};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn pod_ip_probe_follows_pod_state() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = Arc::new(Provisioner::new(cluster.clone(), ProvisionerConfig::default()));
        let probe = PodIpProbe::new(provisioner.clone());
        let key = SandboxKey::new(1, 2);

        assert_eq!(probe.probe(key).await, None);

        provisioner
            .create(key, &BTreeMap::new(), &ResourceOverrides::default().resolve(), None)
            .await
            .unwrap();
        assert!(probe.probe(key).await.is_some());

        cluster.clear_pod_ip("sandbox-1-2-0");
        assert_eq!(probe.probe(key).await, None);
    }
}

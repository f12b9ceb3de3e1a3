//! The mDNS service: starts a responder on every eligible interface and
//! publishes the node's own name.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::interfaces::{list_interfaces, node_addresses, AddressFamilies, InterfaceFilter};
use super::resolver::Resolver;
use super::server::{Responder, Server};
use crate::config::Config;
use crate::servicemanager::Service;
use crate::signal::Signal;

pub const MDNS_CONTROLLER_NAME: &str = "mdns-server";

/// Shared, late-bound list of the node's advertised addresses.
///
/// Filled in by [`MdnsController`] once interfaces have been inspected and
/// read by the route controller whenever it publishes a host.
#[derive(Debug, Clone, Default)]
pub struct NodeAddresses(Arc<RwLock<Vec<IpAddr>>>);

impl NodeAddresses {
    pub fn new(ips: Vec<IpAddr>) -> Self {
        Self(Arc::new(RwLock::new(ips)))
    }

    pub fn get(&self) -> Vec<IpAddr> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, ips: Vec<IpAddr>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = ips;
    }
}

pub struct MdnsController {
    node_name: String,
    node_ip: Option<IpAddr>,
    tld: String,
    families: AddressFamilies,
    filter: InterfaceFilter,
    resolver: Arc<Resolver>,
    addresses: NodeAddresses,
}

impl MdnsController {
    pub fn new(cfg: &Config) -> Result<Self> {
        let filter = InterfaceFilter::new(&cfg.excluded_interfaces)
            .context("invalid excluded_interfaces pattern")?;

        Ok(Self {
            node_name: cfg.node_name.clone(),
            node_ip: cfg.node_ip,
            tld: cfg.tld.to_ascii_lowercase(),
            families: AddressFamilies {
                ipv4: cfg.ipv4,
                ipv6: cfg.ipv6,
            },
            filter,
            resolver: Arc::new(Resolver::new()),
            addresses: NodeAddresses::default(),
        })
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    pub fn node_addresses(&self) -> NodeAddresses {
        self.addresses.clone()
    }

    /// Record the node's addresses and, if the node name carries the mDNS
    /// TLD, publish it.
    pub fn expose_node(&self, ips: Vec<IpAddr>) {
        self.addresses.set(ips.clone());

        let name = self.node_name.trim_end_matches('.');
        if name.is_empty() || !name.to_ascii_lowercase().ends_with(&self.tld) {
            debug!(
                "mDNS: node name {:?} does not end in {:?}, not announcing it",
                self.node_name, self.tld
            );
            return;
        }

        info!(
            "mDNS: Host FQDN {:?} will be announced via mDNS on IPs {:?}",
            name, ips
        );
        self.resolver.register(&format!("{}.", name), &ips);
    }
}

#[async_trait]
impl Service for MdnsController {
    fn name(&self) -> &str {
        MDNS_CONTROLLER_NAME
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        ready: Signal,
        stopped: Signal,
    ) -> anyhow::Result<()> {
        let stop = Signal::new();

        let interfaces = list_interfaces().unwrap_or_else(|e| {
            warn!("mDNS: failed to list network interfaces: {:#}", e);
            Vec::new()
        });

        // NOTE: this listens on the physical interfaces of the host.
        let responder: Arc<dyn Responder> = self.resolver();
        for iface in &interfaces {
            if self.filter.is_excluded(&iface.name) {
                debug!("mDNS: skipping excluded interface {:?}", iface.name);
                continue;
            }
            info!(
                "mDNS: Starting server on interface {:?}, NodeIP {:?}, NodeName {:?}",
                iface.name, self.node_ip, self.node_name
            );
            let server = Server::start(iface, Arc::clone(&responder), stop.clone());
            if server.listener_count() == 0 {
                warn!("mDNS: no listeners joined on interface {:?}", server.interface());
            }
        }

        let node_ip = self.node_ip.or_else(|| local_ip_address::local_ip().ok());
        let ips = match node_ip {
            Some(ip) => node_addresses(ip, &interfaces, self.families),
            None => {
                warn!("mDNS: could not determine the node IP, node name will not resolve");
                Vec::new()
            }
        };
        self.expose_node(ips);

        ready.fire();

        cancel.cancelled().await;

        stop.fire();
        stopped.fire();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_server::proto::rr::{Name, RData, RecordType};

    fn controller(node_name: &str) -> MdnsController {
        let cfg = Config {
            node_name: node_name.to_string(),
            node_ip: Some("10.0.0.5".parse().unwrap()),
            ..Config::default()
        };
        MdnsController::new(&cfg).unwrap()
    }

    #[test]
    fn test_self_host_exposure() {
        let ctl = controller("node1.local");
        ctl.expose_node(node_addresses(
            "10.0.0.5".parse().unwrap(),
            &[],
            AddressFamilies {
                ipv4: true,
                ipv6: true,
            },
        ));

        let resolver = ctl.resolver();
        assert!(resolver.contains("node1.local."));

        let answers = resolver.answer(&Name::from_ascii("node1.local.").unwrap(), RecordType::A);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ttl(), 120);
        assert_eq!(
            answers[0].data(),
            Some(&RData::A("10.0.0.5".parse::<std::net::Ipv4Addr>().unwrap().into()))
        );
        assert_eq!(ctl.node_addresses().get(), vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_node_without_tld_is_not_exposed() {
        let ctl = controller("node1.example.com");
        ctl.expose_node(vec!["10.0.0.5".parse().unwrap()]);
        assert!(ctl.resolver().names().is_empty());
        // Addresses are still recorded for route hosts.
        assert_eq!(ctl.node_addresses().get().len(), 1);
    }

    #[test]
    fn test_invalid_interface_pattern() {
        let cfg = Config {
            excluded_interfaces: vec!["(".to_string()],
            ..Config::default()
        };
        assert!(MdnsController::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let ctl = controller("node1.local");
        let cancel = CancellationToken::new();
        let (ready, stopped) = (Signal::new(), Signal::new());

        let run = {
            let (cancel, ready, stopped) = (cancel.clone(), ready.clone(), stopped.clone());
            async move { ctl.run(cancel, ready, stopped).await }
        };
        let handle = tokio::spawn(run);

        tokio::time::timeout(std::time::Duration::from_secs(10), ready.wait())
            .await
            .expect("mdns controller never became ready");
        assert!(!stopped.is_fired());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(stopped.is_fired());
    }
}
